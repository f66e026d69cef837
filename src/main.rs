//! Binary entry point for memvault.
//!
//! Thin operational CLI over [`memvault::MemoryService`]: it owns the
//! service lifecycle (open, bootstrap, command, persist, shutdown).

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use memvault::config::MemvaultConfig;
use memvault::observability;
use memvault::services::{BootstrapOutcome, ServiceStatus};
use memvault::{MemoryService, SessionId};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Memvault - embedding storage and retrieval for conversational AI memory.
#[derive(Parser)]
#[command(name = "memvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "MEMVAULT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show store and index status.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List sessions with their record counts.
    Sessions,

    /// Rebuild the ANN index from the record store and persist the snapshot.
    Reindex,

    /// Delete every record in a session.
    DeleteSession {
        /// Session identifier.
        session_id: String,
    },

    /// Persist the ANN index snapshot.
    Snapshot {
        /// Write to this path instead of the configured snapshot file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Main entry point.
fn main() -> ExitCode {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), cli.data_dir.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    let logging = config.logging.clone().with_verbose(cli.verbose);
    let _observability = match observability::init(&logging, &config.metrics) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Opens the service, runs the command, then persists and shuts down.
fn run(command: Commands, config: MemvaultConfig) -> anyhow::Result<()> {
    let service = MemoryService::open(config).context("failed to open memory service")?;

    match command {
        Commands::Status { json } => cmd_status(&service, json)?,
        Commands::Sessions => cmd_sessions(&service)?,
        Commands::Reindex => cmd_reindex(&service)?,
        Commands::DeleteSession { session_id } => cmd_delete_session(&service, &session_id)?,
        Commands::Snapshot { output } => cmd_snapshot(&service, output.as_deref())?,
    }

    service.shutdown().context("failed to persist ANN snapshot")
}

/// Loads configuration from an explicit file or the default location.
fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<MemvaultConfig> {
    let config = match path {
        Some(path) => MemvaultConfig::load_from_file(path)
            .with_context(|| format!("invalid config file {}", path.display()))?,
        None => MemvaultConfig::load_default(),
    };
    let config = match data_dir {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    };
    config.validate()?;
    Ok(config)
}

fn cmd_status(service: &MemoryService, json: bool) -> anyhow::Result<()> {
    let status = service.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &ServiceStatus) {
    println!("Memvault Status");
    println!("===============");
    println!("Database:       {}", status.database_path.display());
    println!("Schema version: {}", status.schema_version);
    println!("Records:        {}", status.records);
    println!("Sessions:       {}", status.sessions);
    println!();
    println!("ANN index ({})", status.index_backend);
    println!(
        "  Vectors:      {} / {}",
        status.index_count, status.index_capacity
    );
    println!("  Health:       {}", status.index_health);
    println!("  Snapshot:     {}", status.snapshot_path.display());
    if let Some(report) = &status.last_bootstrap {
        match &report.outcome {
            BootstrapOutcome::Restored => println!("  Bootstrap:    restored from snapshot"),
            BootstrapOutcome::Backfilled { reason } => println!(
                "  Bootstrap:    backfilled {} records, skipped {} ({reason})",
                report.indexed, report.skipped
            ),
        }
    }
    println!("Cache entries:  {}", status.cache_entries);
}

fn cmd_sessions(service: &MemoryService) -> anyhow::Result<()> {
    let sessions = service.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for session in &sessions {
        println!("{session}\t{}", service.session_size(session)?);
    }
    Ok(())
}

fn cmd_reindex(service: &MemoryService) -> anyhow::Result<()> {
    let report = service.rebuild_index()?;
    let path = service.persist_index()?;
    println!(
        "Indexed {} records ({} skipped) in {}ms; snapshot written to {}",
        report.indexed,
        report.skipped,
        report.duration_ms,
        path.display()
    );
    Ok(())
}

fn cmd_delete_session(service: &MemoryService, raw: &str) -> anyhow::Result<()> {
    let session = SessionId::parse(raw)?;
    let removed = service.delete_session(&session)?;
    if removed == 0 {
        println!("Session '{session}' has no records.");
    } else {
        println!(
            "Deleted {removed} records from '{session}'. Index: {}",
            service.index().health()
        );
    }
    Ok(())
}

fn cmd_snapshot(service: &MemoryService, output: Option<&Path>) -> anyhow::Result<()> {
    let path = match output {
        Some(path) => {
            service.persist_index_to(path)?;
            path.to_path_buf()
        },
        None => service.persist_index()?,
    };
    println!(
        "Persisted {} vectors to {}",
        service.index().count(),
        path.display()
    );
    Ok(())
}
