#![forbid(unsafe_code)]

use veil_kernel_contracts::detector::{MetricRecord, ResultRecord};
use veil_kernel_contracts::fhe::{CipherWidth, CiphertextHandle};

use crate::fhe_backend::{BackendError, HomomorphicOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    VolumeSpike,
    TimeCluster,
    VelocityChange,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::VolumeSpike => "volume_spike",
            MetricKind::TimeCluster => "time_cluster",
            MetricKind::VelocityChange => "velocity_change",
        }
    }

    fn handle_in(self, record: &MetricRecord) -> &CiphertextHandle {
        match self {
            MetricKind::VolumeSpike => &record.volume_spike,
            MetricKind::TimeCluster => &record.time_cluster,
            MetricKind::VelocityChange => &record.velocity_change,
        }
    }
}

/// Adds `weight` to the risk score when the metric is strictly above `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdRule {
    pub metric: MetricKind,
    pub threshold: u64,
    pub weight: u64,
}

// Protocol constants. Any result-compatible evaluator must use exactly these.
pub const DETECTION_RULES: [ThresholdRule; 3] = [
    ThresholdRule {
        metric: MetricKind::VolumeSpike,
        threshold: 50,
        weight: 40,
    },
    ThresholdRule {
        metric: MetricKind::TimeCluster,
        threshold: 30,
        weight: 35,
    },
    ThresholdRule {
        metric: MetricKind::VelocityChange,
        threshold: 20,
        weight: 25,
    },
];

pub const VERDICT_CUTOFF: u64 = 50;
pub const MAX_RISK_SCORE: u64 = 100;

const _: () = assert!(
    DETECTION_RULES[0].weight + DETECTION_RULES[1].weight + DETECTION_RULES[2].weight
        == MAX_RISK_SCORE
);

/// Width of the risk accumulator; must hold `0..=MAX_RISK_SCORE` without wrapping.
pub const RISK_WIDTH: CipherWidth = CipherWidth::U64;

/// Runs the detection rules over encrypted metrics.
///
/// Each rule becomes `select(metric > threshold, weight, 0)` and the selections are
/// summed into an encrypted accumulator; the verdict is `risk > VERDICT_CUTOFF`,
/// also encrypted. Nothing is decrypted along the way.
pub fn evaluate_rules<O>(ops: &O, metrics: &MetricRecord) -> Result<ResultRecord, BackendError>
where
    O: HomomorphicOps + ?Sized,
{
    let zero = ops.trivial(0, RISK_WIDTH)?;
    let mut risk = zero.clone();
    for rule in DETECTION_RULES {
        let hit = ops.gt_const(rule.metric.handle_in(metrics), rule.threshold)?;
        let weight = ops.trivial(rule.weight, RISK_WIDTH)?;
        let contribution = ops.select(&hit, &weight, &zero)?;
        risk = ops.add(&risk, &contribution)?;
    }
    let verdict = ops.gt_const(&risk, VERDICT_CUTOFF)?;
    ResultRecord::v1(verdict, risk).map_err(|_| BackendError::EvaluationFailed {
        reason: "backend produced result handles of the wrong width",
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceOutcome {
    pub risk_score: u64,
    pub suspicious: bool,
}

/// Plaintext evaluation of the same rules. Owner-side only, for checking decrypted results.
pub fn reference_outcome(
    volume_spike: u64,
    time_cluster: u64,
    velocity_change: u64,
) -> ReferenceOutcome {
    let risk_score = DETECTION_RULES
        .iter()
        .filter(|rule| {
            let value = match rule.metric {
                MetricKind::VolumeSpike => volume_spike,
                MetricKind::TimeCluster => time_cluster,
                MetricKind::VelocityChange => velocity_change,
            };
            value > rule.threshold
        })
        .map(|rule| rule.weight)
        .sum();
    ReferenceOutcome {
        risk_score,
        suspicious: risk_score > VERDICT_CUTOFF,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::fhe_backend::EncryptionBackend;
    use crate::sim_fhe::{SimFheClient, SimFheEvaluator, SimFheKey};
    use veil_kernel_contracts::detector::Identity;

    fn setup() -> (SimFheClient, SimFheEvaluator) {
        let key = SimFheKey::generate();
        (
            key.client_for(Identity::new("rules_owner").unwrap()),
            key.evaluator(),
        )
    }

    fn encrypted(client: &SimFheClient, a: u64, b: u64, c: u64) -> MetricRecord {
        MetricRecord::v1(
            client.encrypt(a, CipherWidth::U64).unwrap(),
            client.encrypt(b, CipherWidth::U64).unwrap(),
            client.encrypt(c, CipherWidth::U64).unwrap(),
        )
        .unwrap()
    }

    fn run(a: u64, b: u64, c: u64) -> (u64, bool) {
        let (client, ev) = setup();
        let result = evaluate_rules(&ev, &encrypted(&client, a, b, c)).unwrap();
        let risk = client.decrypt(&result.risk_score, CipherWidth::U64).unwrap();
        let verdict = client.decrypt(&result.verdict, CipherWidth::Bool).unwrap();
        (risk, verdict == 1)
    }

    #[test]
    fn at_rules_01_sample_metrics() {
        assert_eq!(run(42, 18, 27), (25, false));
    }

    #[test]
    fn at_rules_02_all_rules_fire_just_above_threshold() {
        assert_eq!(run(51, 31, 21), (100, true));
    }

    #[test]
    fn at_rules_03_thresholds_are_strict() {
        assert_eq!(run(50, 30, 20), (0, false));
    }

    #[test]
    fn at_rules_04_verdict_cutoff_is_strict() {
        // 40 + 0 + 0 = 40, 0 + 35 + 0 = 35, 40 + 0 + 25 = 65
        assert_eq!(run(51, 0, 0), (40, false));
        assert_eq!(run(0, 31, 0), (35, false));
        assert_eq!(run(51, 0, 21), (65, true));
        assert_eq!(run(0, 31, 21), (60, true));
    }

    #[test]
    fn at_rules_05_encrypted_matches_reference_over_grid() {
        let (client, ev) = setup();
        let points = [0u64, 20, 21, 30, 31, 50, 51, 100];
        for &a in &points {
            for &b in &points {
                for &c in &points {
                    let result = evaluate_rules(&ev, &encrypted(&client, a, b, c)).unwrap();
                    let expected = reference_outcome(a, b, c);
                    assert_eq!(
                        client.decrypt(&result.risk_score, CipherWidth::U64).unwrap(),
                        expected.risk_score
                    );
                    assert_eq!(
                        client.decrypt(&result.verdict, CipherWidth::Bool).unwrap() == 1,
                        expected.suspicious
                    );
                }
            }
        }
    }

    #[test]
    fn at_rules_06_reevaluation_is_deterministic_but_rerandomized() {
        let (client, ev) = setup();
        let metrics = encrypted(&client, 60, 40, 10);
        let first = evaluate_rules(&ev, &metrics).unwrap();
        let second = evaluate_rules(&ev, &metrics).unwrap();
        assert_ne!(first.risk_score, second.risk_score);
        assert_eq!(
            client.decrypt(&first.risk_score, CipherWidth::U64).unwrap(),
            client.decrypt(&second.risk_score, CipherWidth::U64).unwrap()
        );
        assert_eq!(client.decrypt(&first.risk_score, CipherWidth::U64).unwrap(), 75);
    }

    #[test]
    fn at_rules_07_reference_extremes() {
        assert_eq!(
            reference_outcome(0, 0, 0),
            ReferenceOutcome {
                risk_score: 0,
                suspicious: false
            }
        );
        assert_eq!(
            reference_outcome(u64::MAX, u64::MAX, u64::MAX),
            ReferenceOutcome {
                risk_score: MAX_RISK_SCORE,
                suspicious: true
            }
        );
    }

    struct CountingOps {
        inner: SimFheEvaluator,
        calls: Cell<u32>,
    }

    impl HomomorphicOps for CountingOps {
        fn validate(
            &self,
            handle: &CiphertextHandle,
            width: CipherWidth,
        ) -> Result<(), BackendError> {
            self.inner.validate(handle, width)
        }

        fn trivial(
            &self,
            value: u64,
            width: CipherWidth,
        ) -> Result<CiphertextHandle, BackendError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.trivial(value, width)
        }

        fn gt_const(
            &self,
            a: &CiphertextHandle,
            k: u64,
        ) -> Result<CiphertextHandle, BackendError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.gt_const(a, k)
        }

        fn select(
            &self,
            cond: &CiphertextHandle,
            if_true: &CiphertextHandle,
            if_false: &CiphertextHandle,
        ) -> Result<CiphertextHandle, BackendError> {
            if self.calls.get() >= 6 {
                return Err(BackendError::EvaluationFailed {
                    reason: "injected failure",
                });
            }
            self.calls.set(self.calls.get() + 1);
            self.inner.select(cond, if_true, if_false)
        }

        fn add(
            &self,
            a: &CiphertextHandle,
            b: &CiphertextHandle,
        ) -> Result<CiphertextHandle, BackendError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.add(a, b)
        }
    }

    #[test]
    fn at_rules_08_backend_failure_surfaces_unchanged() {
        let (client, ev) = setup();
        let ops = CountingOps {
            inner: ev,
            calls: Cell::new(0),
        };
        let err = evaluate_rules(&ops, &encrypted(&client, 1, 2, 3)).unwrap_err();
        assert_eq!(
            err,
            BackendError::EvaluationFailed {
                reason: "injected failure"
            }
        );
    }
}
