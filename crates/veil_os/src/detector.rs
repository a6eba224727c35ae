#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;

use veil_engines::fhe_backend::{BackendError, HomomorphicOps};
use veil_engines::rules::evaluate_rules;
use veil_kernel_contracts::detector::{
    DetectorEvent, DetectorSessionState, Identity, MetricRecord,
};
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};
use veil_kernel_contracts::{ContractViolation, ReasonCodeId};
use veil_storage::detector_store::{
    DetectorStore, StorageError, DEFAULT_MAX_EVENTS, DEFAULT_MAX_IDENTITIES,
};
use veil_storage::repo::DetectorRepo;

use crate::event_sink::DetectorEventSink;

pub mod reason_codes {
    use veil_kernel_contracts::ReasonCodeId;

    // Detector protocol reason-code namespace.
    pub const DET_OK_METRICS_SUBMITTED: ReasonCodeId = ReasonCodeId(0x4454_0001);
    pub const DET_OK_DETECTION_COMPLETED: ReasonCodeId = ReasonCodeId(0x4454_0002);
    pub const DET_INVALID_CIPHERTEXT: ReasonCodeId = ReasonCodeId(0x4454_00F1);
    pub const DET_NO_METRICS: ReasonCodeId = ReasonCodeId(0x4454_00F2);
    pub const DET_NO_RESULT: ReasonCodeId = ReasonCodeId(0x4454_00F3);
    pub const DET_BACKEND_FAILURE: ReasonCodeId = ReasonCodeId(0x4454_00F4);
    pub const DET_STORAGE_FAILURE: ReasonCodeId = ReasonCodeId(0x4454_00F5);
    pub const DET_CONTRACT_VALIDATION_FAILED: ReasonCodeId = ReasonCodeId(0x4454_00F6);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    pub emit_events: bool,
    pub max_identities: usize,
    pub max_events: usize,
}

impl DetectorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            emit_events: true,
            max_identities: DEFAULT_MAX_IDENTITIES,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorError {
    InvalidCiphertext {
        field: &'static str,
        reason: &'static str,
    },
    NoMetrics {
        identity: String,
    },
    NoResult {
        identity: String,
    },
    Backend(BackendError),
    Storage(StorageError),
    ContractViolation(ContractViolation),
}

impl DetectorError {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::InvalidCiphertext { .. } => reason_codes::DET_INVALID_CIPHERTEXT,
            Self::NoMetrics { .. } => reason_codes::DET_NO_METRICS,
            Self::NoResult { .. } => reason_codes::DET_NO_RESULT,
            Self::Backend(_) => reason_codes::DET_BACKEND_FAILURE,
            Self::Storage(_) => reason_codes::DET_STORAGE_FAILURE,
            Self::ContractViolation(_) => reason_codes::DET_CONTRACT_VALIDATION_FAILED,
        }
    }
}

impl fmt::Display for DetectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCiphertext { field, reason } => {
                write!(f, "invalid ciphertext for {field}: {reason}")
            }
            Self::NoMetrics { identity } => write!(f, "no metrics submitted by {identity}"),
            Self::NoResult { identity } => write!(f, "no detection result for {identity}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::ContractViolation(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for DetectorError {}

impl From<BackendError> for DetectorError {
    fn from(err: BackendError) -> Self {
        DetectorError::Backend(err)
    }
}

impl From<ContractViolation> for DetectorError {
    fn from(v: ContractViolation) -> Self {
        DetectorError::ContractViolation(v)
    }
}

impl From<StorageError> for DetectorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NoMetrics { identity } => DetectorError::NoMetrics { identity },
            other => DetectorError::Storage(other),
        }
    }
}

/// Externally callable surface of the encrypted detection protocol.
///
/// Owns the keyed store and the compute-side backend for its whole lifetime.
/// Every mutating call either commits completely or leaves the store untouched;
/// callers serialize access (`&mut self`).
pub struct DetectorProtocol<O, R = DetectorStore>
where
    O: HomomorphicOps,
    R: DetectorRepo,
{
    config: DetectorConfig,
    ops: O,
    store: R,
    sinks: Vec<Box<dyn DetectorEventSink + Send>>,
}

impl<O> DetectorProtocol<O, DetectorStore>
where
    O: HomomorphicOps,
{
    pub fn new(config: DetectorConfig, ops: O) -> Self {
        let store = DetectorStore::with_limits(config.max_identities, config.max_events);
        Self::with_repo(config, ops, store)
    }
}

impl<O, R> DetectorProtocol<O, R>
where
    O: HomomorphicOps,
    R: DetectorRepo,
{
    pub fn with_repo(config: DetectorConfig, ops: O, store: R) -> Self {
        Self {
            config,
            ops,
            store,
            sinks: Vec::new(),
        }
    }

    pub fn register_sink(&mut self, sink: Box<dyn DetectorEventSink + Send>) {
        self.sinks.push(sink);
    }

    pub fn submit_metrics(
        &mut self,
        identity: &Identity,
        volume_spike: CiphertextHandle,
        time_cluster: CiphertextHandle,
        velocity_change: CiphertextHandle,
    ) -> Result<DetectorEvent, DetectorError> {
        for (field, handle) in [
            ("volume_spike", &volume_spike),
            ("time_cluster", &time_cluster),
            ("velocity_change", &velocity_change),
        ] {
            if handle.width() != CipherWidth::U64 {
                return Err(DetectorError::InvalidCiphertext {
                    field,
                    reason: "expected a uint64 ciphertext",
                });
            }
            self.ops
                .validate(handle, CipherWidth::U64)
                .map_err(|err| DetectorError::InvalidCiphertext {
                    field,
                    reason: match err {
                        BackendError::InvalidCiphertext { reason } => reason,
                        _ => "backend rejected ciphertext",
                    },
                })?;
        }

        self.ops
            .validate_together(&[&volume_spike, &time_cluster, &velocity_change])
            .map_err(|err| DetectorError::InvalidCiphertext {
                field: "metric_record",
                reason: match err {
                    BackendError::InvalidCiphertext { reason } => reason,
                    _ => "backend rejected ciphertext set",
                },
            })?;

        let record = MetricRecord::v1(volume_spike, time_cluster, velocity_change)?;
        let event = self.store.upsert_metrics_row(identity, record)?;
        self.publish(&event);
        Ok(event)
    }

    /// Anyone may trigger evaluation; only the owner can read what it produces.
    pub fn evaluate(&mut self, identity: &Identity) -> Result<DetectorEvent, DetectorError> {
        let metrics = self
            .store
            .metrics_row(identity)
            .ok_or_else(|| DetectorError::NoMetrics {
                identity: identity.to_string(),
            })?;
        let result = evaluate_rules(&self.ops, metrics)?;
        let event = self.store.upsert_result_row(identity, result)?;
        self.publish(&event);
        Ok(event)
    }

    pub fn get_result(&self, identity: &Identity) -> Result<CiphertextHandle, DetectorError> {
        self.store
            .result_row(identity)
            .map(|r| r.verdict.clone())
            .ok_or_else(|| DetectorError::NoResult {
                identity: identity.to_string(),
            })
    }

    pub fn get_risk_score(&self, identity: &Identity) -> Result<CiphertextHandle, DetectorError> {
        self.store
            .result_row(identity)
            .map(|r| r.risk_score.clone())
            .ok_or_else(|| DetectorError::NoResult {
                identity: identity.to_string(),
            })
    }

    pub fn has_submitted_metrics(&self, identity: &Identity) -> bool {
        self.store.session_state_row(identity).has_metrics()
    }

    pub fn has_detection_result(&self, identity: &Identity) -> bool {
        self.store.session_state_row(identity).has_result()
    }

    pub fn session_state(&self, identity: &Identity) -> DetectorSessionState {
        self.store.session_state_row(identity)
    }

    /// Retained ledger rows, oldest first.
    pub fn events(&self) -> &VecDeque<DetectorEvent> {
        self.store.event_rows()
    }

    pub fn repo(&self) -> &R {
        &self.store
    }

    fn publish(&mut self, event: &DetectorEvent) {
        if !self.config.emit_events {
            return;
        }
        for sink in &mut self.sinks {
            sink.on_event(event);
        }
    }
}
