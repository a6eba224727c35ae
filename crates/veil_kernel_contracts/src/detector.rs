#![forbid(unsafe_code)]

use std::fmt;

use serde::Serialize;

use crate::fhe::{CipherWidth, CiphertextHandle, Fingerprint};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const DETECTOR_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Account-level key of a data owner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Validate for Identity {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must be <= 128 chars",
            });
        }
        if !self.0.is_ascii() {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must be ASCII",
            });
        }
        Ok(())
    }
}

fn expect_width(
    field: &'static str,
    handle: &CiphertextHandle,
    width: CipherWidth,
) -> Result<(), ContractViolation> {
    handle.validate()?;
    if handle.width() != width {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "ciphertext width mismatch",
        });
    }
    Ok(())
}

/// The three encrypted trading metrics stored for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    pub schema_version: SchemaVersion,
    pub volume_spike: CiphertextHandle,
    pub time_cluster: CiphertextHandle,
    pub velocity_change: CiphertextHandle,
}

impl MetricRecord {
    pub fn v1(
        volume_spike: CiphertextHandle,
        time_cluster: CiphertextHandle,
        velocity_change: CiphertextHandle,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: DETECTOR_CONTRACT_VERSION,
            volume_spike,
            time_cluster,
            velocity_change,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn handles(&self) -> [&CiphertextHandle; 3] {
        [&self.volume_spike, &self.time_cluster, &self.velocity_change]
    }
}

impl Validate for MetricRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        expect_width(
            "metric_record.volume_spike",
            &self.volume_spike,
            CipherWidth::U64,
        )?;
        expect_width(
            "metric_record.time_cluster",
            &self.time_cluster,
            CipherWidth::U64,
        )?;
        expect_width(
            "metric_record.velocity_change",
            &self.velocity_change,
            CipherWidth::U64,
        )?;
        Ok(())
    }
}

/// Encrypted evaluation output: the verdict bit and the accumulated risk score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub schema_version: SchemaVersion,
    pub verdict: CiphertextHandle,
    pub risk_score: CiphertextHandle,
}

impl ResultRecord {
    pub fn v1(
        verdict: CiphertextHandle,
        risk_score: CiphertextHandle,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: DETECTOR_CONTRACT_VERSION,
            verdict,
            risk_score,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn handles(&self) -> [&CiphertextHandle; 2] {
        [&self.verdict, &self.risk_score]
    }
}

impl Validate for ResultRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        expect_width("result_record.verdict", &self.verdict, CipherWidth::Bool)?;
        expect_width(
            "result_record.risk_score",
            &self.risk_score,
            CipherWidth::U64,
        )?;
        Ok(())
    }
}

/// Per-identity progress through the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSessionState {
    #[default]
    Empty,
    HasMetrics,
    HasResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorOp {
    Submit,
    Evaluate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRefused {
    pub from: DetectorSessionState,
    pub op: DetectorOp,
}

impl fmt::Display for TransitionRefused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not allowed from {:?}", self.op, self.from)
    }
}

impl std::error::Error for TransitionRefused {}

impl DetectorSessionState {
    /// Submission is accepted from every state and always lands in `HasMetrics`;
    /// evaluation needs metrics.
    pub fn next(self, op: DetectorOp) -> Result<Self, TransitionRefused> {
        match (self, op) {
            (_, DetectorOp::Submit) => Ok(DetectorSessionState::HasMetrics),
            (DetectorSessionState::Empty, DetectorOp::Evaluate) => {
                Err(TransitionRefused { from: self, op })
            }
            (DetectorSessionState::HasMetrics, DetectorOp::Evaluate)
            | (DetectorSessionState::HasResult, DetectorOp::Evaluate) => {
                Ok(DetectorSessionState::HasResult)
            }
        }
    }

    pub fn has_metrics(self) -> bool {
        !matches!(self, DetectorSessionState::Empty)
    }

    pub fn has_result(self) -> bool {
        matches!(self, DetectorSessionState::HasResult)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DetectorEventId(pub u64);

impl Validate for DetectorEventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "detector_event_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorEventKind {
    MetricsSubmitted,
    DetectionCompleted,
}

/// Audit record published after a successful submit or evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorEvent {
    pub event_id: DetectorEventId,
    pub kind: DetectorEventKind,
    pub identity: Identity,
    pub fingerprint: Fingerprint,
}

impl DetectorEvent {
    pub fn v1(
        event_id: DetectorEventId,
        kind: DetectorEventKind,
        identity: Identity,
        fingerprint: Fingerprint,
    ) -> Result<Self, ContractViolation> {
        let event = Self {
            event_id,
            kind,
            identity,
            fingerprint,
        };
        event.validate()?;
        Ok(event)
    }
}

impl Validate for DetectorEvent {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.event_id.validate()?;
        self.identity.validate()
    }
}
