#![forbid(unsafe_code)]

use std::fmt;

use veil_kernel_contracts::detector::Identity;
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    InvalidCiphertext { reason: &'static str },
    EncryptionFailed { reason: &'static str },
    DecryptionFailed { reason: &'static str },
    Unauthorized,
    EvaluationFailed { reason: &'static str },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCiphertext { reason } => write!(f, "invalid ciphertext: {reason}"),
            Self::EncryptionFailed { reason } => write!(f, "encryption failed: {reason}"),
            Self::DecryptionFailed { reason } => write!(f, "decryption failed: {reason}"),
            Self::Unauthorized => write!(f, "caller is not allowed to decrypt this ciphertext"),
            Self::EvaluationFailed { reason } => write!(f, "encrypted evaluation failed: {reason}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Owner-side half of the encryption backend. Holds the decryption capability
/// for one identity and never runs inside the protocol core.
pub trait EncryptionBackend {
    /// Identity whose decryption binding this backend holds.
    fn owner(&self) -> &Identity;
    fn encrypt(&self, value: u64, width: CipherWidth) -> Result<CiphertextHandle, BackendError>;
    fn decrypt(&self, handle: &CiphertextHandle, width: CipherWidth) -> Result<u64, BackendError>;
}

/// Compute-side half of the encryption backend.
///
/// Every operation consumes and produces ciphertext handles. There is no
/// method that yields a plaintext, so code generic over this trait cannot
/// observe the values it computes on.
pub trait HomomorphicOps {
    /// Checks that `handle` is a well-formed ciphertext of the given width.
    fn validate(&self, handle: &CiphertextHandle, width: CipherWidth) -> Result<(), BackendError>;

    /// Checks that already-validated handles can be combined in one evaluation.
    /// Backends without per-handle decryption bindings accept every set.
    fn validate_together(&self, _handles: &[&CiphertextHandle]) -> Result<(), BackendError> {
        Ok(())
    }

    /// Public (trivial) encryption of a protocol constant.
    fn trivial(&self, value: u64, width: CipherWidth) -> Result<CiphertextHandle, BackendError>;

    /// Encrypted `a > k`, returned in the boolean domain.
    fn gt_const(&self, a: &CiphertextHandle, k: u64) -> Result<CiphertextHandle, BackendError>;

    /// Encrypted `cond ? if_true : if_false`.
    fn select(
        &self,
        cond: &CiphertextHandle,
        if_true: &CiphertextHandle,
        if_false: &CiphertextHandle,
    ) -> Result<CiphertextHandle, BackendError>;

    /// Encrypted wrapping addition in the 64-bit domain.
    fn add(
        &self,
        a: &CiphertextHandle,
        b: &CiphertextHandle,
    ) -> Result<CiphertextHandle, BackendError>;
}
