#![forbid(unsafe_code)]

//! Owner-side sequencing: encrypt, submit, evaluate, fetch, decrypt.
//!
//! Runs entirely on the data owner's side of the boundary. The protocol facade
//! only ever sees the handles this module hands it.

use std::fmt;

use veil_engines::fhe_backend::{BackendError, EncryptionBackend, HomomorphicOps};
use veil_engines::rules::{reference_outcome, ReferenceOutcome};
use veil_kernel_contracts::detector::{DetectorEvent, Identity};
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};
use veil_kernel_contracts::{ContractViolation, Validate};
use veil_storage::repo::DetectorRepo;

use crate::detector::{DetectorError, DetectorProtocol};

/// Upper bound of every metric input slider.
pub const METRIC_INPUT_MAX: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingMetrics {
    pub volume_spike: u64,
    pub time_cluster: u64,
    pub velocity_change: u64,
}

impl TradingMetrics {
    pub fn v1(
        volume_spike: u64,
        time_cluster: u64,
        velocity_change: u64,
    ) -> Result<Self, ContractViolation> {
        let metrics = Self {
            volume_spike,
            time_cluster,
            velocity_change,
        };
        metrics.validate()?;
        Ok(metrics)
    }

    pub fn reference(&self) -> ReferenceOutcome {
        reference_outcome(self.volume_spike, self.time_cluster, self.velocity_change)
    }
}

impl Validate for TradingMetrics {
    fn validate(&self) -> Result<(), ContractViolation> {
        for (field, got) in [
            ("trading_metrics.volume_spike", self.volume_spike),
            ("trading_metrics.time_cluster", self.time_cluster),
            ("trading_metrics.velocity_change", self.velocity_change),
        ] {
            if got > METRIC_INPUT_MAX {
                return Err(ContractViolation::InvalidRange {
                    field,
                    min: 0,
                    max: METRIC_INPUT_MAX,
                    got,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Input(ContractViolation),
    Backend(BackendError),
    Protocol(DetectorError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(v) => write!(f, "invalid input: {v}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ContractViolation> for ClientError {
    fn from(v: ContractViolation) -> Self {
        ClientError::Input(v)
    }
}

impl From<BackendError> for ClientError {
    fn from(err: BackendError) -> Self {
        ClientError::Backend(err)
    }
}

impl From<DetectorError> for ClientError {
    fn from(err: DetectorError) -> Self {
        ClientError::Protocol(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptedVerdict {
    pub risk_score: u64,
    pub suspicious: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionReport {
    pub identity: Identity,
    pub verdict: DecryptedVerdict,
    pub expected: ReferenceOutcome,
    pub submitted: DetectorEvent,
    pub completed: DetectorEvent,
}

impl DetectionReport {
    pub fn matches_reference(&self) -> bool {
        self.verdict.risk_score == self.expected.risk_score
            && self.verdict.suspicious == self.expected.suspicious
    }
}

pub struct DetectorClient<B: EncryptionBackend> {
    identity: Identity,
    backend: B,
}

impl<B: EncryptionBackend> DetectorClient<B> {
    /// The submitting identity is the backend's owner, so handles this client
    /// submits are always decryptable by the same client.
    pub fn new(backend: B) -> Self {
        Self {
            identity: backend.owner().clone(),
            backend,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn encrypt_metrics(
        &self,
        metrics: &TradingMetrics,
    ) -> Result<[CiphertextHandle; 3], ClientError> {
        metrics.validate()?;
        Ok([
            self.backend.encrypt(metrics.volume_spike, CipherWidth::U64)?,
            self.backend.encrypt(metrics.time_cluster, CipherWidth::U64)?,
            self.backend.encrypt(metrics.velocity_change, CipherWidth::U64)?,
        ])
    }

    pub fn submit<O, R>(
        &self,
        protocol: &mut DetectorProtocol<O, R>,
        metrics: &TradingMetrics,
    ) -> Result<DetectorEvent, ClientError>
    where
        O: HomomorphicOps,
        R: DetectorRepo,
    {
        let [volume_spike, time_cluster, velocity_change] = self.encrypt_metrics(metrics)?;
        Ok(protocol.submit_metrics(&self.identity, volume_spike, time_cluster, velocity_change)?)
    }

    pub fn fetch_verdict<O, R>(
        &self,
        protocol: &DetectorProtocol<O, R>,
    ) -> Result<DecryptedVerdict, ClientError>
    where
        O: HomomorphicOps,
        R: DetectorRepo,
    {
        let verdict = protocol.get_result(&self.identity)?;
        let risk = protocol.get_risk_score(&self.identity)?;
        Ok(DecryptedVerdict {
            risk_score: self.backend.decrypt(&risk, CipherWidth::U64)?,
            suspicious: self.backend.decrypt(&verdict, CipherWidth::Bool)? == 1,
        })
    }

    /// Full round: submit, evaluate, then decrypt the result locally.
    pub fn run_detection<O, R>(
        &self,
        protocol: &mut DetectorProtocol<O, R>,
        metrics: &TradingMetrics,
    ) -> Result<DetectionReport, ClientError>
    where
        O: HomomorphicOps,
        R: DetectorRepo,
    {
        let submitted = self.submit(protocol, metrics)?;
        let completed = protocol.evaluate(&self.identity)?;
        let verdict = self.fetch_verdict(protocol)?;
        Ok(DetectionReport {
            identity: self.identity.clone(),
            verdict,
            expected: metrics.reference(),
            submitted,
            completed,
        })
    }
}
