#![forbid(unsafe_code)]

use std::fmt;

use serde::{Serialize, Serializer};

use crate::{ContractViolation, Validate};

pub const MAX_HANDLE_BYTES: usize = 4096;

/// Logical plaintext domain a ciphertext was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherWidth {
    Bool,
    U64,
}

impl CipherWidth {
    pub fn tag(self) -> u8 {
        match self {
            CipherWidth::Bool => 0x01,
            CipherWidth::U64 => 0x40,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(CipherWidth::Bool),
            0x40 => Some(CipherWidth::U64),
            _ => None,
        }
    }

    /// Largest plaintext representable in this domain.
    pub fn max_value(self) -> u64 {
        match self {
            CipherWidth::Bool => 1,
            CipherWidth::U64 => u64::MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CipherWidth::Bool => "bool",
            CipherWidth::U64 => "uint64",
        }
    }
}

/// Opaque encrypted scalar.
///
/// The bytes are owned by whichever encryption backend produced them. Nothing in
/// the protocol core reads them except to hand them back to a backend or to
/// hash them for an audit fingerprint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CiphertextHandle {
    width: CipherWidth,
    bytes: Vec<u8>,
}

impl CiphertextHandle {
    pub fn from_backend_bytes(
        width: CipherWidth,
        bytes: Vec<u8>,
    ) -> Result<Self, ContractViolation> {
        let handle = Self { width, bytes };
        handle.validate()?;
        Ok(handle)
    }

    pub fn width(&self) -> CipherWidth {
        self.width
    }

    pub fn as_backend_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_backend_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Validate for CiphertextHandle {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.bytes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "ciphertext_handle.bytes",
                reason: "must not be empty",
            });
        }
        if self.bytes.len() > MAX_HANDLE_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "ciphertext_handle.bytes",
                reason: "exceeds max handle length",
            });
        }
        Ok(())
    }
}

// Handles never print their bytes; a length is enough to debug with.
impl fmt::Debug for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CiphertextHandle")
            .field("width", &self.width)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// SHA-256 digest over ciphertext bytes, published in audit events.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
