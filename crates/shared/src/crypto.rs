//! Hashing utilities for verification fingerprints.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input and returns it as a hex string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Incremental builder for a canonical, unambiguous SHA-256 fingerprint.
///
/// Every field is written as `name`, `value` with explicit length prefixes, so
/// `("ab", "c")` and `("a", "bc")` can never collide. Callers are responsible
/// for feeding fields in a canonical order.
pub struct Fingerprint {
    hasher: Sha256,
    fields: usize,
}

impl Fingerprint {
    /// Start a fingerprint under a domain tag (e.g. `"energy-report/v1"`).
    pub fn new(domain: &str) -> Self {
        let mut fp = Self {
            hasher: Sha256::new(),
            fields: 0,
        };
        fp.write_raw(domain.as_bytes());
        fp
    }

    /// Append a string field.
    pub fn field(&mut self, name: &str, value: &str) -> &mut Self {
        self.write_raw(name.as_bytes());
        self.write_raw(value.as_bytes());
        self.fields += 1;
        self
    }

    /// Append a floating point field with fixed precision.
    ///
    /// Negative zero is folded into zero so that `-0.0` and `0.0` fingerprint the same.
    pub fn float(&mut self, name: &str, value: f64, precision: usize) -> &mut Self {
        let value = if value == 0.0 { 0.0 } else { value };
        let rendered = format!("{:.*}", precision, value);
        self.field(name, &rendered)
    }

    /// Append an optional floating point field; `None` is encoded distinctly from any number.
    pub fn opt_float(&mut self, name: &str, value: Option<f64>, precision: usize) -> &mut Self {
        match value {
            Some(v) => self.float(name, v, precision),
            None => self.field(name, "null"),
        }
    }

    /// Append an integer field.
    pub fn int(&mut self, name: &str, value: i64) -> &mut Self {
        self.field(name, &value.to_string())
    }

    /// Number of fields written so far.
    pub fn len(&self) -> usize {
        self.fields
    }

    /// Whether no field has been written yet.
    pub fn is_empty(&self) -> bool {
        self.fields == 0
    }

    /// Finish and return the lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }
}
