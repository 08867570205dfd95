//! Background scavenge runner
//!
//! At most one scavenge runs at a time. Each run gets an id, runs on its
//! own tokio task and publishes its status on a watch channel. Only the most
//! recent finished runs stay in memory; the scavenge log keeps the history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::StorageError;
use crate::scavenge::{ScavengeOptions, ScavengeStatus, ScavengeSummary, Scavenger};

struct RunHandle {
    stop: Arc<AtomicBool>,
    status: watch::Receiver<ScavengeStatus>,
}

/// Finished runs kept by default
pub const DEFAULT_FINISHED_RUNS: usize = 32;

#[derive(Default)]
struct ServiceState {
    current: Option<String>,
    runs: HashMap<String, RunHandle>,
    summaries: HashMap<String, ScavengeSummary>,
    finished: VecDeque<String>,
    finished_limit: usize,
}

impl ServiceState {
    fn finish(&mut self, scavenge_id: String, summary: ScavengeSummary) {
        if self.current.as_deref() == Some(scavenge_id.as_str()) {
            self.current = None;
        }
        self.summaries.insert(scavenge_id.clone(), summary);
        self.finished.push_back(scavenge_id);
        while self.finished.len() > self.finished_limit {
            if let Some(oldest) = self.finished.pop_front() {
                self.runs.remove(&oldest);
                self.summaries.remove(&oldest);
            }
        }
    }
}

pub struct ScavengeService {
    scavenger: Arc<Scavenger>,
    state: Arc<Mutex<ServiceState>>,
}

impl ScavengeService {
    pub fn new(scavenger: Scavenger) -> Self {
        Self {
            scavenger: Arc::new(scavenger),
            state: Arc::new(Mutex::new(ServiceState {
                finished_limit: DEFAULT_FINISHED_RUNS,
                ..ServiceState::default()
            })),
        }
    }

    /// Keep at most `limit` finished runs queryable by id
    pub fn with_finished_limit(self, limit: usize) -> Self {
        self.state.lock().finished_limit = limit.max(1);
        self
    }

    /// Start a scavenge in the background and return its id
    #[instrument(skip(self))]
    pub fn start(&self, options: ScavengeOptions) -> Result<String, StorageError> {
        let mut state = self.state.lock();
        if let Some(current) = &state.current {
            return Err(StorageError::ScavengeInProgress(current.clone()));
        }

        let scavenge_id = Uuid::new_v4().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = watch::channel(ScavengeStatus::Started);
        state.current = Some(scavenge_id.clone());
        state.runs.insert(
            scavenge_id.clone(),
            RunHandle {
                stop: Arc::clone(&stop),
                status: status_rx,
            },
        );
        drop(state);

        info!(scavenge_id = %scavenge_id, "Starting scavenge");
        let scavenger = Arc::clone(&self.scavenger);
        let shared = Arc::clone(&self.state);
        let id = scavenge_id.clone();
        tokio::spawn(async move {
            let _ = status_tx.send(ScavengeStatus::InProgress);
            let summary = scavenger.scavenge(&id, &options, &stop).await;
            let status = summary.status;
            shared.lock().finish(id, summary);
            let _ = status_tx.send(status);
        });

        Ok(scavenge_id)
    }

    /// Ask a running scavenge to stop after the current chunk
    pub fn stop(&self, scavenge_id: &str) -> Result<(), StorageError> {
        let state = self.state.lock();
        let run = state
            .runs
            .get(scavenge_id)
            .ok_or_else(|| StorageError::UnknownScavenge(scavenge_id.to_string()))?;
        run.stop.store(true, Ordering::Release);
        info!(scavenge_id, "Stop requested");
        Ok(())
    }

    /// Wait for a run to reach a final status
    pub async fn wait(&self, scavenge_id: &str) -> Result<ScavengeStatus, StorageError> {
        let mut status = {
            let state = self.state.lock();
            state
                .runs
                .get(scavenge_id)
                .map(|run| run.status.clone())
                .ok_or_else(|| StorageError::UnknownScavenge(scavenge_id.to_string()))?
        };
        let value = status
            .wait_for(|s| s.is_final())
            .await
            .map_err(|_| StorageError::Closed)?;
        Ok(*value)
    }

    /// Current status of a run started by this service
    pub fn status(&self, scavenge_id: &str) -> Option<ScavengeStatus> {
        self.state
            .lock()
            .runs
            .get(scavenge_id)
            .map(|run| *run.status.borrow())
    }

    /// Summary of a finished run
    pub fn summary(&self, scavenge_id: &str) -> Option<ScavengeSummary> {
        self.state.lock().summaries.get(scavenge_id).cloned()
    }

    pub fn current(&self) -> Option<String> {
        self.state.lock().current.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().current.is_some()
    }
}
