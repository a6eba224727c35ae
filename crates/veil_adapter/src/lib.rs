#![forbid(unsafe_code)]

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use veil_engines::sim_fhe::{SimFheEvaluator, SimFheKey};
use veil_kernel_contracts::detector::{DetectorEvent, DetectorSessionState, Identity};
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};
use veil_os::detector::{reason_codes, DetectorConfig, DetectorError, DetectorProtocol};
use veil_os::event_sink::JsonlEventSink;
use veil_storage::repo::DetectorRepo;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSubmitAdapterRequest {
    pub identity: String,
    pub volume_spike: String,
    pub time_cluster: String,
    pub velocity_change: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DetectionAdapterRequest {
    pub identity: String,
}

/// Returned by submit and evaluate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DetectorEventAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub reason_code: Option<u32>,
    pub event_id: Option<u64>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DetectionResultAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub reason_code: Option<u32>,
    pub verdict: Option<String>,
    pub risk_score: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DetectionStatusAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub has_submitted_metrics: bool,
    pub has_detection_result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub identities: usize,
    pub events: usize,
}

/// Failure surfaced to the HTTP layer. `reason_code` is set when the protocol
/// itself refused the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub reason: String,
    pub reason_code: Option<u32>,
}

impl AdapterFailure {
    fn request(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            reason_code: None,
        }
    }

    fn malformed_ciphertext(reason: String) -> Self {
        Self {
            reason,
            reason_code: Some(reason_codes::DET_INVALID_CIPHERTEXT.0),
        }
    }
}

impl From<DetectorError> for AdapterFailure {
    fn from(err: DetectorError) -> Self {
        Self {
            reason: err.to_string(),
            reason_code: Some(err.reason_code().0),
        }
    }
}

pub struct AdapterRuntime {
    protocol: DetectorProtocol<SimFheEvaluator>,
}

impl AdapterRuntime {
    pub fn new(config: DetectorConfig, key: &SimFheKey) -> Self {
        Self {
            protocol: DetectorProtocol::new(config, key.evaluator()),
        }
    }

    /// Builds the runtime from `VEIL_SIM_FHE_KEY_B64` and `VEIL_EVENT_LOG`.
    /// Returns the key alongside when it had to be generated.
    pub fn default_from_env() -> Result<(Self, Option<SimFheKey>), String> {
        let (key, generated) = match env::var("VEIL_SIM_FHE_KEY_B64") {
            Ok(raw) if !raw.trim().is_empty() => (SimFheKey::from_base64(&raw)?, false),
            _ => (SimFheKey::generate(), true),
        };
        let mut runtime = Self::new(DetectorConfig::mvp_v1(), &key);
        if parse_event_log_enabled(env::var("VEIL_EVENT_LOG").ok().as_deref()) {
            runtime
                .protocol
                .register_sink(Box::new(JsonlEventSink::new(std::io::stderr())));
        }
        Ok((runtime, generated.then_some(key)))
    }

    pub fn protocol(&self) -> &DetectorProtocol<SimFheEvaluator> {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut DetectorProtocol<SimFheEvaluator> {
        &mut self.protocol
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, String> {
        let repo = self.protocol.repo();
        repo.check_invariants()
            .map_err(|e| format!("detector store invariant broken: {e}"))?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            identities: repo.identity_count(),
            events: repo.event_rows().len(),
        })
    }

    pub fn run_metrics_submit(
        &mut self,
        request: MetricsSubmitAdapterRequest,
    ) -> Result<DetectorEventAdapterResponse, AdapterFailure> {
        let identity = parse_identity(&request.identity)?;
        let volume_spike = decode_handle("volume_spike", &request.volume_spike)?;
        let time_cluster = decode_handle("time_cluster", &request.time_cluster)?;
        let velocity_change = decode_handle("velocity_change", &request.velocity_change)?;
        let event =
            self.protocol
                .submit_metrics(&identity, volume_spike, time_cluster, velocity_change)?;
        Ok(event_response("METRICS_SUBMITTED", &event))
    }

    pub fn run_evaluate(
        &mut self,
        request: DetectionAdapterRequest,
    ) -> Result<DetectorEventAdapterResponse, AdapterFailure> {
        let identity = parse_identity(&request.identity)?;
        let event = self.protocol.evaluate(&identity)?;
        Ok(event_response("DETECTION_COMPLETED", &event))
    }

    pub fn run_result_fetch(
        &self,
        request: DetectionAdapterRequest,
    ) -> Result<DetectionResultAdapterResponse, AdapterFailure> {
        let identity = parse_identity(&request.identity)?;
        let verdict = self.protocol.get_result(&identity)?;
        let risk_score = self.protocol.get_risk_score(&identity)?;
        Ok(DetectionResultAdapterResponse {
            status: "ok".to_string(),
            outcome: "RESULT_AVAILABLE".to_string(),
            reason: None,
            reason_code: None,
            verdict: Some(encode_handle(&verdict)),
            risk_score: Some(encode_handle(&risk_score)),
        })
    }

    pub fn run_status(
        &self,
        request: DetectionAdapterRequest,
    ) -> Result<DetectionStatusAdapterResponse, AdapterFailure> {
        let identity = parse_identity(&request.identity)?;
        let state = self.protocol.session_state(&identity);
        Ok(DetectionStatusAdapterResponse {
            status: "ok".to_string(),
            outcome: session_state_label(state).to_string(),
            reason: None,
            has_submitted_metrics: state.has_metrics(),
            has_detection_result: state.has_result(),
        })
    }
}

pub fn parse_event_log_enabled(raw: Option<&str>) -> bool {
    match raw {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => true,
    }
}

/// Writes a freshly generated key to `out_path` as base64 and returns the startup
/// note to print. The note never carries key material. Without a path the key
/// stays in memory only. An existing file is never overwritten.
pub fn export_generated_key(key: &SimFheKey, out_path: Option<&Path>) -> Result<String, String> {
    let Some(path) = out_path else {
        return Ok(
            "VEIL_SIM_FHE_KEY_B64 not set: using an ephemeral key that is not exported \
             (set VEIL_SIM_FHE_KEY_OUT to persist it)"
                .to_string(),
        );
    };
    write_new_file_restricted(path, key.to_base64().as_bytes()).map_err(|e| {
        format!(
            "failed to write generated sim fhe key to '{}': {e}",
            path.display()
        )
    })?;
    Ok(format!(
        "VEIL_SIM_FHE_KEY_B64 not set: generated key written to '{}'",
        path.display()
    ))
}

fn write_new_file_restricted(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(data)?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn encode_handle(handle: &CiphertextHandle) -> String {
    BASE64.encode(handle.as_backend_bytes())
}

/// Metric inputs are always uint64 ciphertexts. A handle that cannot be decoded
/// is a malformed ciphertext and carries the same reason code the facade uses.
pub fn decode_handle(field: &str, raw: &str) -> Result<CiphertextHandle, AdapterFailure> {
    let bytes = BASE64.decode(raw.trim().as_bytes()).map_err(|e| {
        AdapterFailure::malformed_ciphertext(format!("{field} is not valid base64: {e}"))
    })?;
    CiphertextHandle::from_backend_bytes(CipherWidth::U64, bytes)
        .map_err(|e| AdapterFailure::malformed_ciphertext(format!("{field}: {e}")))
}

fn parse_identity(raw: &str) -> Result<Identity, AdapterFailure> {
    Identity::new(raw.trim()).map_err(|e| AdapterFailure::request(e.to_string()))
}

fn event_response(outcome: &str, event: &DetectorEvent) -> DetectorEventAdapterResponse {
    DetectorEventAdapterResponse {
        status: "ok".to_string(),
        outcome: outcome.to_string(),
        reason: None,
        reason_code: None,
        event_id: Some(event.event_id.0),
        fingerprint: Some(event.fingerprint.to_hex()),
    }
}

fn session_state_label(state: DetectorSessionState) -> &'static str {
    match state {
        DetectorSessionState::Empty => "EMPTY",
        DetectorSessionState::HasMetrics => "HAS_METRICS",
        DetectorSessionState::HasResult => "HAS_RESULT",
    }
}
