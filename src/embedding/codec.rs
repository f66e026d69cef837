//! Vector codec.
//!
//! Converts between embeddings and their durable byte form, and enforces
//! the vector invariants every stored and queried embedding must satisfy:
//!
//! - length equals the deployment dimension
//! - every component is finite
//! - L2 norm is 1 (so cosine similarity is a plain dot product)
//!
//! Serialization is fixed-width little-endian `f32`, so a vector of
//! dimension `d` always occupies `4 * d` bytes.

use crate::{Error, Result};

/// Small finite value substituted for non-finite components and used to
/// lift an all-zero vector off the origin.
pub const NUDGE_COMPONENT: f32 = 1e-6;

const F32_WIDTH: usize = std::mem::size_of::<f32>();

/// Returns the L2 norm of `vector`, accumulated in `f64`.
#[must_use]
pub fn l2_norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Divides `vector` by its L2 norm.
///
/// A zero or non-finite norm leaves the input unchanged. Callers must not
/// rely on this to repair degenerate input; run [`sanitize`] first.
#[must_use]
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = l2_norm(vector);
    if norm == 0.0 || !norm.is_finite() {
        return vector.to_vec();
    }
    vector
        .iter()
        .map(|&x| (f64::from(x) / norm) as f32)
        .collect()
}

/// Repairs `vector` into a usable embedding of length `dim`.
///
/// - non-finite components become [`NUDGE_COMPONENT`]
/// - a length mismatch is truncated or zero-padded to `dim` and logged at
///   warn level, since it signals an upstream error even though the call
///   succeeds
/// - an all-zero result has every component set to [`NUDGE_COMPONENT`]
///
/// The result is not normalized.
///
/// # Errors
///
/// Returns [`Error::InvalidVector`] if `dim` is zero or `vector` is empty,
/// because there is nothing to resolve a length or direction from.
pub fn sanitize(vector: &[f32], dim: usize) -> Result<Vec<f32>> {
    if dim == 0 {
        return Err(Error::InvalidVector(
            "target dimension must be at least 1".to_string(),
        ));
    }
    if vector.is_empty() {
        return Err(Error::InvalidVector("empty vector".to_string()));
    }

    let mut replaced = 0usize;
    let mut out: Vec<f32> = vector
        .iter()
        .map(|&x| {
            if x.is_finite() {
                x
            } else {
                replaced += 1;
                NUDGE_COMPONENT
            }
        })
        .collect();

    if replaced > 0 {
        tracing::debug!(replaced, "Replaced non-finite embedding components");
        metrics::counter!("codec_nonfinite_components_total").increment(replaced as u64);
    }

    if out.len() != dim {
        tracing::warn!(
            expected = dim,
            actual = out.len(),
            "Embedding dimension mismatch coerced by truncate/pad"
        );
        metrics::counter!("codec_dimension_coercions_total").increment(1);
        out.resize(dim, 0.0);
    }

    if out.iter().all(|&x| x == 0.0) {
        tracing::debug!("Nudged all-zero embedding");
        out.fill(NUDGE_COMPONENT);
    }

    Ok(out)
}

/// Serializes `vector` as little-endian `f32`s.
#[must_use]
pub fn encode(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * F32_WIDTH);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserializes little-endian `f32`s produced by [`encode`].
///
/// # Errors
///
/// Returns [`Error::InvalidVector`] if the byte length is not a multiple of 4.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % F32_WIDTH != 0 {
        return Err(Error::InvalidVector(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(F32_WIDTH)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Dot product of two equal-length vectors.
///
/// For unit vectors this is the cosine similarity. Extra trailing
/// components of the longer slice are ignored.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Dimension-aware codec for one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorCodec {
    dim: usize,
}

impl VectorCodec {
    /// Creates a codec for embeddings of length `dim`.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Returns the configured dimension.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dim
    }

    /// Checks length and finiteness without modifying the vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for a wrong length and
    /// [`Error::InvalidVector`] for non-finite components.
    pub fn validate(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
            return Err(Error::InvalidVector(format!(
                "component {pos} is not finite"
            )));
        }
        Ok(())
    }

    /// Validates strictly, then normalizes.
    ///
    /// An all-zero vector is nudged rather than rejected, so the stored
    /// vector is never identically zero.
    ///
    /// # Errors
    ///
    /// See [`VectorCodec::validate`].
    pub fn prepare(&self, vector: &[f32]) -> Result<Vec<f32>> {
        self.validate(vector)?;
        if vector.iter().all(|&x| x == 0.0) {
            return Ok(normalize(&vec![NUDGE_COMPONENT; self.dim]));
        }
        Ok(normalize(vector))
    }

    /// Sanitizes to the configured dimension, then normalizes.
    ///
    /// Only used at the API boundary when dimension coercion is enabled.
    ///
    /// # Errors
    ///
    /// See [`sanitize`].
    pub fn prepare_lenient(&self, vector: &[f32]) -> Result<Vec<f32>> {
        sanitize(vector, self.dim).map(|v| normalize(&v))
    }

    /// Decodes a stored blob and checks it against the configured dimension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVector`] for a malformed blob and
    /// [`Error::DimensionMismatch`] for a wrong length.
    pub fn decode_checked(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let vector = decode(bytes)?;
        self.validate(&vector)?;
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_unit(v: &[f32]) {
        assert!((l2_norm(v) - 1.0).abs() < 1e-5, "norm was {}", l2_norm(v));
    }

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_unit(&v);
    }

    #[test]
    fn test_normalize_zero_is_noop() {
        assert_eq!(normalize(&[0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_normalize_non_finite_is_noop() {
        let v = normalize(&[f32::NAN, 1.0]);
        assert!(v[0].is_nan());
        assert!((v[1] - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_normalize_tiny_components() {
        let v = normalize(&[1e-30, 1e-30]);
        assert_unit(&v);
    }

    #[test]
    fn test_sanitize_replaces_non_finite() {
        let v = sanitize(&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 2.0], 4).unwrap();
        assert!(v.iter().all(|x| x.is_finite()));
        assert!((v[3] - 2.0).abs() < f32::EPSILON);
        assert!((v[0] - NUDGE_COMPONENT).abs() < f32::EPSILON);
    }

    #[test]
    fn test_sanitize_pads_and_truncates() {
        assert_eq!(sanitize(&[1.0, 2.0], 4).unwrap(), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(sanitize(&[1.0, 2.0, 3.0], 2).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_sanitize_zero_vector_is_nudged() {
        let v = sanitize(&[0.0; 8], 8).unwrap();
        assert_eq!(v.len(), 8);
        assert!(v.iter().any(|&x| x != 0.0));
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_sanitize_rejects_unresolvable() {
        assert!(matches!(sanitize(&[], 4), Err(Error::InvalidVector(_))));
        assert!(matches!(sanitize(&[1.0], 0), Err(Error::InvalidVector(_))));
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&[1.0, -2.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap(), vec![1.0, -2.5]);
    }

    #[test]
    fn test_decode_rejects_ragged_blob() {
        assert!(matches!(decode(&[0, 0, 128]), Err(Error::InvalidVector(_))));
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_codec_validate() {
        let codec = VectorCodec::new(3);
        assert!(codec.validate(&[1.0, 0.0, 0.0]).is_ok());
        assert!(matches!(
            codec.validate(&[1.0, 0.0]),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            codec.validate(&[1.0, f32::NAN, 0.0]),
            Err(Error::InvalidVector(_))
        ));
    }

    #[test]
    fn test_prepare_nudges_zero_vector() {
        let codec = VectorCodec::new(4);
        let v = codec.prepare(&[0.0; 4]).unwrap();
        assert_unit(&v);
    }

    #[test]
    fn test_prepare_lenient_coerces() {
        let codec = VectorCodec::new(4);
        let v = codec.prepare_lenient(&[3.0, 4.0]).unwrap();
        assert_eq!(v.len(), 4);
        assert_unit(&v);
    }

    #[test]
    fn test_decode_checked_dimension() {
        let codec = VectorCodec::new(2);
        let blob = encode(&[1.0, 0.0, 0.0]);
        assert!(matches!(
            codec.decode_checked(&blob),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_dot_of_unit_vectors() {
        let a = normalize(&[1.0, 1.0]);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-6);
        assert!(dot(&[1.0, 0.0], &[0.0, 1.0]).abs() < f32::EPSILON);
    }
}
