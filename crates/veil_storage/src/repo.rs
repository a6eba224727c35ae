#![forbid(unsafe_code)]

use std::collections::VecDeque;

use veil_kernel_contracts::detector::{
    DetectorEvent, DetectorSessionState, Identity, MetricRecord, ResultRecord,
};

use crate::detector_store::{DetectorStore, StorageError};

/// Typed repository interface for the detector tables
/// (`detector_metrics`, `detector_results`, `detector_session_states`, `detector_events`).
pub trait DetectorRepo {
    fn upsert_metrics_row(
        &mut self,
        identity: &Identity,
        record: MetricRecord,
    ) -> Result<DetectorEvent, StorageError>;
    fn upsert_result_row(
        &mut self,
        identity: &Identity,
        record: ResultRecord,
    ) -> Result<DetectorEvent, StorageError>;

    fn metrics_row(&self, identity: &Identity) -> Option<&MetricRecord>;
    fn result_row(&self, identity: &Identity) -> Option<&ResultRecord>;
    fn session_state_row(&self, identity: &Identity) -> DetectorSessionState;
    fn event_rows(&self) -> &VecDeque<DetectorEvent>;
    fn event_rows_by_identity(&self, identity: &Identity) -> Vec<&DetectorEvent>;
    fn check_invariants(&self) -> Result<(), StorageError>;
}

impl DetectorRepo for DetectorStore {
    fn upsert_metrics_row(
        &mut self,
        identity: &Identity,
        record: MetricRecord,
    ) -> Result<DetectorEvent, StorageError> {
        self.commit_metrics(identity, record)
    }

    fn upsert_result_row(
        &mut self,
        identity: &Identity,
        record: ResultRecord,
    ) -> Result<DetectorEvent, StorageError> {
        self.commit_result(identity, record)
    }

    fn metrics_row(&self, identity: &Identity) -> Option<&MetricRecord> {
        self.metric_record(identity)
    }

    fn result_row(&self, identity: &Identity) -> Option<&ResultRecord> {
        self.result_record(identity)
    }

    fn session_state_row(&self, identity: &Identity) -> DetectorSessionState {
        self.session_state(identity)
    }

    fn event_rows(&self) -> &VecDeque<DetectorEvent> {
        self.events()
    }

    fn event_rows_by_identity(&self, identity: &Identity) -> Vec<&DetectorEvent> {
        self.events_by_identity(identity)
    }

    fn check_invariants(&self) -> Result<(), StorageError> {
        DetectorStore::check_invariants(self)
    }
}
