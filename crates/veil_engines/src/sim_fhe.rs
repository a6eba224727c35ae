#![forbid(unsafe_code)]

//! Simulated FHE backend.
//!
//! Stands in for a real threshold-FHE network the same way mock coprocessors do:
//! ciphertexts are AES-256-GCM sealed values under a deployment key, and the
//! evaluator opens them internally to apply each operation before resealing the
//! output under a fresh nonce. Callers only ever see sealed handles.
//!
//! Handle layout:
//!
//! ```text
//! "VFH1" | width tag (1) | owner tag (8) | nonce (12) | AES-GCM(value_le_u64) + tag (24)
//! ```
//!
//! The 13-byte header is authenticated as associated data.

use std::fmt;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use veil_kernel_contracts::detector::Identity;
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};

use crate::fhe_backend::{BackendError, EncryptionBackend, HomomorphicOps};

const MAGIC: [u8; 4] = *b"VFH1";
const KEY_LEN: usize = 32;
const OWNER_TAG_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + 1 + OWNER_TAG_LEN;
const SEALED_VALUE_LEN: usize = 8 + 16;
pub const SIM_HANDLE_LEN: usize = HEADER_LEN + NONCE_LEN + SEALED_VALUE_LEN;

/// Deployment key shared by the simulated network's clients and evaluator.
#[derive(Clone, PartialEq, Eq)]
pub struct SimFheKey([u8; KEY_LEN]);

impl fmt::Debug for SimFheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SimFheKey(<redacted>)")
    }
}

impl SimFheKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let decoded = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| format!("sim fhe key is not valid base64: {e}"))?;
        let key: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| format!("sim fhe key must be {KEY_LEN} bytes"))?;
        Ok(Self(key))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn client_for(&self, identity: Identity) -> SimFheClient {
        SimFheClient::new(self.clone(), identity)
    }

    pub fn evaluator(&self) -> SimFheEvaluator {
        SimFheEvaluator::new(self.clone())
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Decryption binding of a ciphertext. Zero marks a public constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerTag([u8; OWNER_TAG_LEN]);

impl OwnerTag {
    pub const PUBLIC: OwnerTag = OwnerTag([0; OWNER_TAG_LEN]);

    pub fn of(identity: &Identity) -> Self {
        let digest = Sha256::digest(identity.as_str().as_bytes());
        let mut tag = [0u8; OWNER_TAG_LEN];
        tag.copy_from_slice(&digest[..OWNER_TAG_LEN]);
        if tag == Self::PUBLIC.0 {
            tag[0] = 1;
        }
        Self(tag)
    }

    fn is_public(self) -> bool {
        self == Self::PUBLIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Opened {
    width: CipherWidth,
    owner: OwnerTag,
    value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenError {
    Malformed(&'static str),
    Forged,
}

fn seal(
    key: &SimFheKey,
    width: CipherWidth,
    owner: OwnerTag,
    value: u64,
) -> Result<CiphertextHandle, &'static str> {
    if value > width.max_value() {
        return Err("value does not fit the ciphertext width");
    }
    let mut header = Vec::with_capacity(SIM_HANDLE_LEN);
    header.extend_from_slice(&MAGIC);
    header.push(width.tag());
    header.extend_from_slice(&owner.0);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let sealed = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &value.to_le_bytes(),
                aad: &header,
            },
        )
        .map_err(|_| "aead seal failed")?;

    let mut bytes = header;
    bytes.extend_from_slice(&nonce_bytes);
    bytes.extend_from_slice(&sealed);
    CiphertextHandle::from_backend_bytes(width, bytes).map_err(|_| "sealed handle rejected")
}

fn open(key: &SimFheKey, handle: &CiphertextHandle) -> Result<Opened, OpenError> {
    let bytes = handle.as_backend_bytes();
    if bytes.len() != SIM_HANDLE_LEN {
        return Err(OpenError::Malformed("unexpected handle length"));
    }
    let (header, rest) = bytes.split_at(HEADER_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    if header[..MAGIC.len()] != MAGIC {
        return Err(OpenError::Malformed("bad magic"));
    }
    let width = CipherWidth::from_tag(header[MAGIC.len()])
        .ok_or(OpenError::Malformed("unknown width tag"))?;
    if width != handle.width() {
        return Err(OpenError::Malformed("width tag disagrees with handle width"));
    }
    let mut owner = [0u8; OWNER_TAG_LEN];
    owner.copy_from_slice(&header[MAGIC.len() + 1..]);

    let plain = key
        .cipher()
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: header,
            },
        )
        .map_err(|_| OpenError::Forged)?;
    let value_bytes: [u8; 8] = plain
        .as_slice()
        .try_into()
        .map_err(|_| OpenError::Malformed("sealed value has wrong length"))?;
    let value = u64::from_le_bytes(value_bytes);
    if value > width.max_value() {
        return Err(OpenError::Malformed("value does not fit the ciphertext width"));
    }
    Ok(Opened {
        width,
        owner: OwnerTag(owner),
        value,
    })
}

/// Owner-side client bound to one identity.
#[derive(Debug, Clone)]
pub struct SimFheClient {
    key: SimFheKey,
    identity: Identity,
    owner: OwnerTag,
}

impl SimFheClient {
    pub fn new(key: SimFheKey, identity: Identity) -> Self {
        let owner = OwnerTag::of(&identity);
        Self {
            key,
            identity,
            owner,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl EncryptionBackend for SimFheClient {
    fn owner(&self) -> &Identity {
        &self.identity
    }

    fn encrypt(&self, value: u64, width: CipherWidth) -> Result<CiphertextHandle, BackendError> {
        seal(&self.key, width, self.owner, value)
            .map_err(|reason| BackendError::EncryptionFailed { reason })
    }

    fn decrypt(&self, handle: &CiphertextHandle, width: CipherWidth) -> Result<u64, BackendError> {
        if handle.width() != width {
            return Err(BackendError::DecryptionFailed {
                reason: "width mismatch",
            });
        }
        let opened = open(&self.key, handle).map_err(|err| match err {
            OpenError::Malformed(reason) => BackendError::DecryptionFailed { reason },
            OpenError::Forged => BackendError::DecryptionFailed {
                reason: "ciphertext authentication failed",
            },
        })?;
        if !opened.owner.is_public() && opened.owner != self.owner {
            return Err(BackendError::Unauthorized);
        }
        Ok(opened.value)
    }
}

/// Compute-side evaluator. Exposes only handle-to-handle operations.
#[derive(Debug, Clone)]
pub struct SimFheEvaluator {
    key: SimFheKey,
}

impl SimFheEvaluator {
    pub fn new(key: SimFheKey) -> Self {
        Self { key }
    }

    fn open_as(&self, handle: &CiphertextHandle, width: CipherWidth) -> Result<Opened, BackendError> {
        let opened = open(&self.key, handle).map_err(|err| match err {
            OpenError::Malformed(reason) => BackendError::InvalidCiphertext { reason },
            OpenError::Forged => BackendError::InvalidCiphertext {
                reason: "ciphertext authentication failed",
            },
        })?;
        if opened.width != width {
            return Err(BackendError::InvalidCiphertext {
                reason: "ciphertext width mismatch",
            });
        }
        Ok(opened)
    }

    fn reseal(
        &self,
        width: CipherWidth,
        owner: OwnerTag,
        value: u64,
    ) -> Result<CiphertextHandle, BackendError> {
        seal(&self.key, width, owner, value)
            .map_err(|reason| BackendError::EvaluationFailed { reason })
    }
}

fn merge_owners(owners: &[OwnerTag]) -> Result<OwnerTag, BackendError> {
    let mut merged = OwnerTag::PUBLIC;
    for owner in owners.iter().copied().filter(|o| !o.is_public()) {
        if merged.is_public() {
            merged = owner;
        } else if merged != owner {
            return Err(BackendError::EvaluationFailed {
                reason: "operands are bound to different owners",
            });
        }
    }
    Ok(merged)
}

impl HomomorphicOps for SimFheEvaluator {
    fn validate(&self, handle: &CiphertextHandle, width: CipherWidth) -> Result<(), BackendError> {
        self.open_as(handle, width).map(|_| ())
    }

    fn validate_together(&self, handles: &[&CiphertextHandle]) -> Result<(), BackendError> {
        let mut owners = Vec::with_capacity(handles.len());
        for handle in handles {
            owners.push(self.open_as(handle, handle.width())?.owner);
        }
        merge_owners(&owners).map(|_| ()).map_err(|_| BackendError::InvalidCiphertext {
            reason: "handles are bound to different owners",
        })
    }

    fn trivial(&self, value: u64, width: CipherWidth) -> Result<CiphertextHandle, BackendError> {
        self.reseal(width, OwnerTag::PUBLIC, value)
    }

    fn gt_const(&self, a: &CiphertextHandle, k: u64) -> Result<CiphertextHandle, BackendError> {
        let a = self.open_as(a, CipherWidth::U64)?;
        self.reseal(CipherWidth::Bool, a.owner, u64::from(a.value > k))
    }

    fn select(
        &self,
        cond: &CiphertextHandle,
        if_true: &CiphertextHandle,
        if_false: &CiphertextHandle,
    ) -> Result<CiphertextHandle, BackendError> {
        if if_true.width() != if_false.width() {
            return Err(BackendError::EvaluationFailed {
                reason: "select branches differ in width",
            });
        }
        let width = if_true.width();
        let c = self.open_as(cond, CipherWidth::Bool)?;
        let t = self.open_as(if_true, width)?;
        let f = self.open_as(if_false, width)?;
        let owner = merge_owners(&[c.owner, t.owner, f.owner])?;
        let value = if c.value == 1 { t.value } else { f.value };
        self.reseal(width, owner, value)
    }

    fn add(
        &self,
        a: &CiphertextHandle,
        b: &CiphertextHandle,
    ) -> Result<CiphertextHandle, BackendError> {
        let a = self.open_as(a, CipherWidth::U64)?;
        let b = self.open_as(b, CipherWidth::U64)?;
        let owner = merge_owners(&[a.owner, b.owner])?;
        self.reseal(CipherWidth::U64, owner, a.value.wrapping_add(b.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    #[test]
    fn at_sim_fhe_01_roundtrip_over_slider_domain() {
        let key = SimFheKey::generate();
        let client = key.client_for(owner("alice"));
        for v in 0..=100u64 {
            let h = client.encrypt(v, CipherWidth::U64).unwrap();
            assert_eq!(client.decrypt(&h, CipherWidth::U64).unwrap(), v);
        }
        for v in [0u64, 1] {
            let h = client.encrypt(v, CipherWidth::Bool).unwrap();
            assert_eq!(client.decrypt(&h, CipherWidth::Bool).unwrap(), v);
        }
    }

    #[test]
    fn at_sim_fhe_02_encryption_is_rerandomized() {
        let client = SimFheKey::generate().client_for(owner("alice"));
        let a = client.encrypt(42, CipherWidth::U64).unwrap();
        let b = client.encrypt(42, CipherWidth::U64).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_backend_bytes().len(), SIM_HANDLE_LEN);
    }

    #[test]
    fn at_sim_fhe_03_bool_out_of_range_fails_encryption() {
        let client = SimFheKey::generate().client_for(owner("alice"));
        assert_eq!(
            client.encrypt(2, CipherWidth::Bool),
            Err(BackendError::EncryptionFailed {
                reason: "value does not fit the ciphertext width"
            })
        );
    }

    #[test]
    fn at_sim_fhe_04_other_owner_is_unauthorized() {
        let key = SimFheKey::generate();
        let alice = key.client_for(owner("alice"));
        let bob = key.client_for(owner("bob"));
        let h = alice.encrypt(7, CipherWidth::U64).unwrap();
        assert_eq!(
            bob.decrypt(&h, CipherWidth::U64),
            Err(BackendError::Unauthorized)
        );
    }

    #[test]
    fn at_sim_fhe_05_tampered_handle_fails() {
        let key = SimFheKey::generate();
        let client = key.client_for(owner("alice"));
        let evaluator = key.evaluator();
        let h = client.encrypt(7, CipherWidth::U64).unwrap();
        let mut bytes = h.into_backend_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let forged = CiphertextHandle::from_backend_bytes(CipherWidth::U64, bytes).unwrap();
        assert!(matches!(
            client.decrypt(&forged, CipherWidth::U64),
            Err(BackendError::DecryptionFailed { .. })
        ));
        assert!(matches!(
            evaluator.validate(&forged, CipherWidth::U64),
            Err(BackendError::InvalidCiphertext { .. })
        ));
    }

    #[test]
    fn at_sim_fhe_06_foreign_key_rejected_by_evaluator() {
        let client = SimFheKey::generate().client_for(owner("alice"));
        let evaluator = SimFheKey::generate().evaluator();
        let h = client.encrypt(7, CipherWidth::U64).unwrap();
        assert!(evaluator.validate(&h, CipherWidth::U64).is_err());
    }

    #[test]
    fn at_sim_fhe_07_ops_compute_over_ciphertexts() {
        let key = SimFheKey::generate();
        let client = key.client_for(owner("alice"));
        let ev = key.evaluator();
        let a = client.encrypt(51, CipherWidth::U64).unwrap();
        let b = client.encrypt(50, CipherWidth::U64).unwrap();

        let gt_a = ev.gt_const(&a, 50).unwrap();
        let gt_b = ev.gt_const(&b, 50).unwrap();
        assert_eq!(client.decrypt(&gt_a, CipherWidth::Bool).unwrap(), 1);
        assert_eq!(client.decrypt(&gt_b, CipherWidth::Bool).unwrap(), 0);

        let forty = ev.trivial(40, CipherWidth::U64).unwrap();
        let zero = ev.trivial(0, CipherWidth::U64).unwrap();
        let picked = ev.select(&gt_a, &forty, &zero).unwrap();
        assert_eq!(client.decrypt(&picked, CipherWidth::U64).unwrap(), 40);

        let sum = ev.add(&picked, &a).unwrap();
        assert_eq!(client.decrypt(&sum, CipherWidth::U64).unwrap(), 91);
    }

    #[test]
    fn at_sim_fhe_08_mixing_owners_fails() {
        let key = SimFheKey::generate();
        let alice = key.client_for(owner("alice"));
        let bob = key.client_for(owner("bob"));
        let ev = key.evaluator();
        let a = alice.encrypt(1, CipherWidth::U64).unwrap();
        let b = bob.encrypt(1, CipherWidth::U64).unwrap();
        assert!(matches!(
            ev.add(&a, &b),
            Err(BackendError::EvaluationFailed { .. })
        ));
    }

    #[test]
    fn at_sim_fhe_11_validate_together_rejects_mixed_owners() {
        let key = SimFheKey::generate();
        let alice = key.client_for(owner("alice"));
        let bob = key.client_for(owner("bob"));
        let ev = key.evaluator();
        let a1 = alice.encrypt(60, CipherWidth::U64).unwrap();
        let a2 = alice.encrypt(30, CipherWidth::U64).unwrap();
        let b = bob.encrypt(40, CipherWidth::U64).unwrap();
        let public = ev.trivial(5, CipherWidth::U64).unwrap();

        assert_eq!(ev.validate_together(&[&a1, &a2, &public]), Ok(()));
        assert_eq!(
            ev.validate_together(&[&a1, &b, &a2]),
            Err(BackendError::InvalidCiphertext {
                reason: "handles are bound to different owners"
            })
        );
    }

    #[test]
    fn at_sim_fhe_09_key_base64_roundtrip() {
        let key = SimFheKey::generate();
        let restored = SimFheKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, restored);
        assert!(SimFheKey::from_base64("c2hvcnQ=").is_err());
        assert_eq!(format!("{key:?}"), "SimFheKey(<redacted>)");
    }

    #[test]
    fn at_sim_fhe_10_width_mismatch_on_decrypt() {
        let client = SimFheKey::generate().client_for(owner("alice"));
        let h = client.encrypt(1, CipherWidth::Bool).unwrap();
        assert_eq!(
            client.decrypt(&h, CipherWidth::U64),
            Err(BackendError::DecryptionFailed {
                reason: "width mismatch"
            })
        );
    }
}
