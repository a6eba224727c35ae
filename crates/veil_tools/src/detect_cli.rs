#![forbid(unsafe_code)]

use veil_engines::rules::{DETECTION_RULES, VERDICT_CUTOFF};
use veil_engines::sim_fhe::SimFheKey;
use veil_kernel_contracts::detector::Identity;
use veil_os::client::{DetectorClient, TradingMetrics};
use veil_os::detector::{DetectorConfig, DetectorProtocol};

pub const USAGE: &str =
    "usage: veil <detect <volume_spike> <time_cluster> <velocity_change> [--identity ID] | rules>";

const DEFAULT_IDENTITY: &str = "local_owner";

pub fn execute_command(subcommand: &str, args: &[String]) -> Result<String, String> {
    match subcommand {
        "detect" => {
            let (metrics, identity) = parse_detect_args(args)?;
            run_local_detection(&metrics, identity)
        }
        "rules" => {
            if !args.is_empty() {
                return Err("usage: veil rules".to_string());
            }
            Ok(render_rules())
        }
        _ => Err(format!(
            "unknown subcommand: {subcommand}. expected one of: detect, rules"
        )),
    }
}

fn parse_detect_args(args: &[String]) -> Result<(TradingMetrics, Identity), String> {
    let mut values = Vec::with_capacity(3);
    let mut identity = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--identity" {
            let raw = iter
                .next()
                .ok_or_else(|| "--identity needs a value".to_string())?;
            identity = Some(Identity::new(raw.as_str()).map_err(|e| e.to_string())?);
        } else {
            let value = arg
                .parse::<u64>()
                .map_err(|_| format!("metric '{arg}' is not a non-negative integer"))?;
            values.push(value);
        }
    }
    let &[volume_spike, time_cluster, velocity_change] = values.as_slice() else {
        return Err(USAGE.to_string());
    };
    let metrics = TradingMetrics::v1(volume_spike, time_cluster, velocity_change)
        .map_err(|e| e.to_string())?;
    let identity = match identity {
        Some(identity) => identity,
        None => Identity::new(DEFAULT_IDENTITY).map_err(|e| e.to_string())?,
    };
    Ok((metrics, identity))
}

/// One full encrypted round against an in-process protocol under a fresh key.
fn run_local_detection(metrics: &TradingMetrics, identity: Identity) -> Result<String, String> {
    let key = SimFheKey::generate();
    let mut protocol = DetectorProtocol::new(DetectorConfig::mvp_v1(), key.evaluator());
    let client = DetectorClient::new(key.client_for(identity));
    let report = client
        .run_detection(&mut protocol, metrics)
        .map_err(|e| format!("detection failed: {e}"))?;
    if !report.matches_reference() {
        return Err(format!(
            "encrypted result diverged from plaintext rules: got risk_score={} expected {}",
            report.verdict.risk_score, report.expected.risk_score
        ));
    }
    Ok([
        format!("identity={}", report.identity),
        format!("risk_score={}", report.verdict.risk_score),
        format!(
            "suspicious={}",
            if report.verdict.suspicious { "YES" } else { "NO" }
        ),
        format!("threshold={VERDICT_CUTOFF}"),
        "reference=MATCH".to_string(),
        format!("submitted_fingerprint={}", report.submitted.fingerprint),
        format!("result_fingerprint={}", report.completed.fingerprint),
    ]
    .join("\n"))
}

fn render_rules() -> String {
    let mut lines: Vec<String> = DETECTION_RULES
        .iter()
        .map(|rule| {
            format!(
                "{} > {} => +{}",
                rule.metric.as_str(),
                rule.threshold,
                rule.weight
            )
        })
        .collect();
    lines.push(format!("suspicious when risk_score > {VERDICT_CUTOFF}"));
    lines.join("\n")
}
