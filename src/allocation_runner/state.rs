use std::time::Duration;

use prost::Message;
use proto_api::function_executor_pb::{
    AllocationOutcomeCode,
    AllocationOutputBlobRequest,
    AllocationPhase,
    AllocationProgress,
    AllocationResult,
    AllocationState,
};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Observable state of one allocation.
///
/// Every change recomputes `sha256_hash`, so watchers compare hashes to
/// tell whether anything moved since their last look.
pub struct AllocationStateWrapper {
    tx: watch::Sender<AllocationState>,
}

fn state_hash(state: &AllocationState) -> String {
    let mut unhashed = state.clone();
    unhashed.sha256_hash = None;
    hex::encode(Sha256::digest(unhashed.encode_to_vec()))
}

impl AllocationStateWrapper {
    pub fn new(allocation_id: &str) -> Self {
        let mut state = AllocationState {
            phase: Some(AllocationPhase::Created as i32),
            allocation_id: Some(allocation_id.to_string()),
            ..Default::default()
        };
        state.sha256_hash = Some(state_hash(&state));
        let (tx, _) = watch::channel(state);
        Self { tx }
    }

    fn modify(&self, f: impl FnOnce(&mut AllocationState)) {
        self.tx.send_modify(|state| {
            f(state);
            state.sha256_hash = Some(state_hash(state));
        });
    }

    pub fn snapshot(&self) -> AllocationState {
        self.tx.borrow().clone()
    }

    pub fn has_result(&self) -> bool {
        self.tx.borrow().result.is_some()
    }

    pub fn set_phase(&self, phase: AllocationPhase) {
        self.modify(|state| state.phase = Some(phase as i32));
    }

    pub fn update_progress(&self, current: f64, total: f64) {
        self.modify(|state| {
            state.progress = Some(AllocationProgress {
                current: Some(current),
                total: Some(total),
            })
        });
    }

    pub fn add_output_blob_request(&self, id: &str, size: u64) {
        self.modify(|state| {
            state.phase = Some(AllocationPhase::AwaitingOutputBlob as i32);
            state.output_blob_requests.push(AllocationOutputBlobRequest {
                id: Some(id.to_string()),
                size: Some(size),
            });
        });
    }

    pub fn remove_output_blob_request(&self, id: &str) {
        self.modify(|state| {
            state
                .output_blob_requests
                .retain(|request| request.id.as_deref() != Some(id));
        });
    }

    /// Terminal; nothing changes afterwards.
    pub fn set_result(&self, result: AllocationResult) {
        let phase = if result.outcome_code() == AllocationOutcomeCode::Success {
            AllocationPhase::CompleteSuccess
        } else {
            AllocationPhase::CompleteFailure
        };
        self.modify(|state| {
            state.phase = Some(phase as i32);
            state.output_blob_requests.clear();
            state.result = Some(result);
        });
    }

    /// Returns the state as soon as its hash differs from `last_seen_hash`,
    /// the allocation is finished, or `timeout` passes.
    pub async fn wait_for_update(
        &self,
        last_seen_hash: Option<&str>,
        timeout: Duration,
    ) -> AllocationState {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    if state.result.is_some() || state.sha256_hash.as_deref() != last_seen_hash {
                        return;
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        let state = rx.borrow().clone();
        state
    }
}
