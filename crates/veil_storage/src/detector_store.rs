#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use sha2::{Digest, Sha256};
use veil_kernel_contracts::detector::{
    DetectorEvent, DetectorEventId, DetectorEventKind, DetectorOp, DetectorSessionState, Identity,
    MetricRecord, ResultRecord,
};
use veil_kernel_contracts::fhe::{CiphertextHandle, Fingerprint};
use veil_kernel_contracts::{ContractViolation, Validate};

pub const DEFAULT_MAX_IDENTITIES: usize = 100_000;
pub const DEFAULT_MAX_EVENTS: usize = 1_000_000;

const METRICS_FINGERPRINT_DOMAIN: &[u8] = b"veil.detector.metrics.v1";
const RESULT_FINGERPRINT_DOMAIN: &[u8] = b"veil.detector.result.v1";

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    NoMetrics { identity: String },
    CapacityExceeded { table: &'static str, max: usize },
    AppendOnlyViolation { table: &'static str },
    InvariantBroken { table: &'static str, key: String },
    ContractViolation(ContractViolation),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMetrics { identity } => write!(f, "no metrics stored for {identity}"),
            Self::CapacityExceeded { table, max } => {
                write!(f, "{table} is full (max {max} rows)")
            }
            Self::AppendOnlyViolation { table } => write!(f, "{table} is append-only"),
            Self::InvariantBroken { table, key } => {
                write!(f, "{table} invariant broken for {key}")
            }
            Self::ContractViolation(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

fn fingerprint(domain: &[u8], handles: &[&CiphertextHandle]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for handle in handles {
        let bytes = handle.as_backend_bytes();
        hasher.update([handle.width().tag()]);
        hasher.update((bytes.len() as u32).to_le_bytes());
        hasher.update(bytes);
    }
    Fingerprint(hasher.finalize().into())
}

pub fn metrics_fingerprint(record: &MetricRecord) -> Fingerprint {
    fingerprint(METRICS_FINGERPRINT_DOMAIN, &record.handles())
}

pub fn result_fingerprint(record: &ResultRecord) -> Fingerprint {
    fingerprint(RESULT_FINGERPRINT_DOMAIN, &record.handles())
}

/// Keyed holder of encrypted metric and result records, one slot of each per identity.
///
/// Only ciphertext handles are ever written here. Every commit builds its event
/// before touching any table so a failure leaves the store unchanged.
#[derive(Debug, Clone)]
pub struct DetectorStore {
    max_identities: usize,
    max_events: usize,
    metrics: BTreeMap<Identity, MetricRecord>,
    results: BTreeMap<Identity, ResultRecord>,
    session_states: BTreeMap<Identity, DetectorSessionState>,
    // Append-only audit ledger. Holds the newest `max_events` rows; older rows
    // are evicted from the front, ids keep counting.
    events: VecDeque<DetectorEvent>,
    next_event_id: u64,
}

impl Default for DetectorStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl DetectorStore {
    pub fn new_in_memory() -> Self {
        Self::with_max_identities(DEFAULT_MAX_IDENTITIES)
    }

    pub fn with_max_identities(max_identities: usize) -> Self {
        Self::with_limits(max_identities, DEFAULT_MAX_EVENTS)
    }

    pub fn with_limits(max_identities: usize, max_events: usize) -> Self {
        Self {
            max_identities,
            max_events: max_events.max(1),
            metrics: BTreeMap::new(),
            results: BTreeMap::new(),
            session_states: BTreeMap::new(),
            events: VecDeque::new(),
            next_event_id: 1,
        }
    }

    pub fn session_state(&self, identity: &Identity) -> DetectorSessionState {
        self.session_states
            .get(identity)
            .copied()
            .unwrap_or_default()
    }

    pub fn identity_count(&self) -> usize {
        self.session_states.len()
    }

    pub fn commit_metrics(
        &mut self,
        identity: &Identity,
        record: MetricRecord,
    ) -> Result<DetectorEvent, StorageError> {
        identity.validate()?;
        record.validate()?;

        let current = self.session_state(identity);
        if current == DetectorSessionState::Empty && self.identity_count() >= self.max_identities
        {
            return Err(StorageError::CapacityExceeded {
                table: "detector_metrics",
                max: self.max_identities,
            });
        }
        let next = current
            .next(DetectorOp::Submit)
            .map_err(|_| StorageError::InvariantBroken {
                table: "detector_session_states",
                key: identity.to_string(),
            })?;
        let event = self.build_event(
            DetectorEventKind::MetricsSubmitted,
            identity,
            metrics_fingerprint(&record),
        )?;

        // New metrics invalidate whatever result was computed from the old ones.
        self.results.remove(identity);
        self.metrics.insert(identity.clone(), record);
        self.session_states.insert(identity.clone(), next);
        self.push_event(event.clone());
        Ok(event)
    }

    pub fn commit_result(
        &mut self,
        identity: &Identity,
        record: ResultRecord,
    ) -> Result<DetectorEvent, StorageError> {
        identity.validate()?;
        record.validate()?;

        let next = self
            .session_state(identity)
            .next(DetectorOp::Evaluate)
            .map_err(|_| StorageError::NoMetrics {
                identity: identity.to_string(),
            })?;
        if !self.metrics.contains_key(identity) {
            return Err(StorageError::InvariantBroken {
                table: "detector_metrics",
                key: identity.to_string(),
            });
        }
        let event = self.build_event(
            DetectorEventKind::DetectionCompleted,
            identity,
            result_fingerprint(&record),
        )?;

        self.results.insert(identity.clone(), record);
        self.session_states.insert(identity.clone(), next);
        self.push_event(event.clone());
        Ok(event)
    }

    pub fn metric_record(&self, identity: &Identity) -> Option<&MetricRecord> {
        self.metrics.get(identity)
    }

    pub fn result_record(&self, identity: &Identity) -> Option<&ResultRecord> {
        self.results.get(identity)
    }

    pub fn events(&self) -> &VecDeque<DetectorEvent> {
        &self.events
    }

    pub fn events_by_identity(&self, identity: &Identity) -> Vec<&DetectorEvent> {
        self.events
            .iter()
            .filter(|ev| &ev.identity == identity)
            .collect()
    }

    pub fn attempt_overwrite_event(
        &mut self,
        _event_id: DetectorEventId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "detector_events",
        })
    }

    /// Cross-table consistency: every result sits on top of metrics and the
    /// recorded session state matches which records exist.
    pub fn check_invariants(&self) -> Result<(), StorageError> {
        for identity in self.results.keys() {
            if !self.metrics.contains_key(identity) {
                return Err(StorageError::InvariantBroken {
                    table: "detector_results",
                    key: identity.to_string(),
                });
            }
        }
        for (identity, state) in &self.session_states {
            let consistent = state.has_metrics() == self.metrics.contains_key(identity)
                && state.has_result() == self.results.contains_key(identity);
            if !consistent {
                return Err(StorageError::InvariantBroken {
                    table: "detector_session_states",
                    key: identity.to_string(),
                });
            }
        }
        if self.metrics.len() != self.session_states.len() {
            return Err(StorageError::InvariantBroken {
                table: "detector_metrics",
                key: "row_count".to_string(),
            });
        }
        Ok(())
    }

    fn build_event(
        &self,
        kind: DetectorEventKind,
        identity: &Identity,
        fingerprint: Fingerprint,
    ) -> Result<DetectorEvent, StorageError> {
        Ok(DetectorEvent::v1(
            DetectorEventId(self.next_event_id),
            kind,
            identity.clone(),
            fingerprint,
        )?)
    }

    fn push_event(&mut self, event: DetectorEvent) {
        self.next_event_id = self.next_event_id.saturating_add(1);
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}
