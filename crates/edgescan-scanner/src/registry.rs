//! Active-scan registry and job state
//!
//! Each scan's mutable state lives in a single [`JobHandle`], a mutex-guarded
//! record shared by exactly three writers: the scheduler loop, its probe
//! workers, and the task-store flusher. External callers (REST surface,
//! other scans) only read snapshots or request status transitions, so the
//! registry never hands out the raw state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use edgescan_core::{JobSnapshot, OutcomeStats, ProbeOutcome, ScanStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Maximum entries kept in the per-job log ring
const LOG_RING_CAP: usize = 100;

/// How long a paused worker sleeps between status polls
pub const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Whether a suspension point may continue or must abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Abort,
}

#[derive(Debug)]
struct JobState {
    status: ScanStatus,
    total: u64,
    completed: u64,
    found_good: u64,
    stats: OutcomeStats,
    logs: VecDeque<String>,
    results: Vec<ProbeOutcome>,
}

/// Single-owner record of one scan job
pub struct JobHandle {
    pub id: Uuid,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

impl JobHandle {
    pub fn new(id: Uuid, total: u64) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                status: ScanStatus::Queued,
                total,
                completed: 0,
                found_good: 0,
                stats: OutcomeStats::default(),
                logs: VecDeque::new(),
                results: Vec::new(),
            }),
        }
    }

    /// Rebuild a handle from a persisted snapshot (startup recovery)
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.id,
            created_at: snapshot.created_at,
            state: Mutex::new(JobState {
                status: snapshot.status,
                total: snapshot.total,
                completed: snapshot.completed,
                found_good: snapshot.found_good,
                stats: snapshot.stats,
                logs: snapshot.logs.into(),
                results: snapshot.results,
            }),
        }
    }

    pub fn status(&self) -> ScanStatus {
        self.state.lock().status
    }

    /// Request a status transition; illegal transitions are ignored
    ///
    /// Returns whether the transition happened. Terminal states are sinks.
    pub fn set_status(&self, next: ScanStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.can_transition_to(next) {
            debug!("scan {}: {} -> {}", self.id, state.status, next);
            state.status = next;
            true
        } else {
            false
        }
    }

    pub fn found_good(&self) -> u64 {
        self.state.lock().found_good
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn set_total(&self, total: u64) {
        self.state.lock().total = total;
    }

    /// Append a timestamped line to the log ring (capped)
    pub fn add_log(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Utc::now().format("%H:%M:%S"), message.as_ref());
        let mut state = self.state.lock();
        state.logs.push_back(line);
        while state.logs.len() > LOG_RING_CAP {
            state.logs.pop_front();
        }
    }

    /// Record a finished probe: histogram, completion counter, result list
    pub fn record_outcome(&self, outcome: ProbeOutcome) {
        let mut state = self.state.lock();
        state.stats.record(outcome.status);
        state.completed += 1;
        state.results.push(outcome);
    }

    /// Count one good candidate; returns the new total
    pub fn incr_found_good(&self) -> u64 {
        let mut state = self.state.lock();
        state.found_good += 1;
        state.found_good
    }

    /// Point-in-time copy for the REST surface and the task store
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock();
        JobSnapshot {
            id: self.id,
            status: state.status,
            total: state.total,
            completed: state.completed,
            found_good: state.found_good,
            logs: state.logs.iter().cloned().collect(),
            stats: state.stats,
            results: state.results.clone(),
            created_at: self.created_at,
        }
    }

    /// Suspension-point check: spins while paused, aborts on terminal states
    pub async fn gate(&self) -> Gate {
        loop {
            match self.status() {
                ScanStatus::Paused => tokio::time::sleep(PAUSE_POLL).await,
                ScanStatus::Queued | ScanStatus::Running => return Gate::Proceed,
                _ => return Gate::Abort,
            }
        }
    }
}

/// Process-wide registry of scans, keyed by scan id
#[derive(Default)]
pub struct ScanRegistry {
    jobs: DashMap<Uuid, Arc<JobHandle>>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<JobHandle>) {
        self.jobs.insert(handle.id, handle);
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<JobHandle>> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn pause(&self, id: &Uuid) -> bool {
        self.get(id)
            .map(|job| job.set_status(ScanStatus::Paused))
            .unwrap_or(false)
    }

    pub fn resume(&self, id: &Uuid) -> bool {
        self.get(id)
            .map(|job| job.set_status(ScanStatus::Running))
            .unwrap_or(false)
    }

    /// Soft stop: in-flight probes observe the change and abort
    pub fn stop(&self, id: &Uuid) -> bool {
        self.get(id)
            .map(|job| job.set_status(ScanStatus::Stopped))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgescan_core::OutcomeStatus;

    #[test]
    fn test_log_ring_cap() {
        let job = JobHandle::new(Uuid::new_v4(), 10);
        for i in 0..150 {
            job.add_log(format!("line {}", i));
        }
        let snapshot = job.snapshot();
        assert_eq!(snapshot.logs.len(), LOG_RING_CAP);
        assert!(snapshot.logs[0].contains("line 50"));
        assert!(snapshot.logs.last().unwrap().contains("line 149"));
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        let job = JobHandle::new(Uuid::new_v4(), 10);
        assert!(job.set_status(ScanStatus::Running));
        assert!(job.set_status(ScanStatus::Completed));
        assert!(!job.set_status(ScanStatus::Running));
        assert!(!job.set_status(ScanStatus::Stopped));
        assert_eq!(job.status(), ScanStatus::Completed);
    }

    #[test]
    fn test_record_outcome_updates_counters() {
        let job = JobHandle::new(Uuid::new_v4(), 4);
        job.record_outcome(ProbeOutcome::new("1.1.1.1", 443, OutcomeStatus::Ok));
        job.record_outcome(ProbeOutcome::new("1.1.1.2", 443, OutcomeStatus::HighPing));

        let snapshot = job.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.stats.scanned, 2);
        assert_eq!(snapshot.stats.high_ping, 1);
        assert_eq!(snapshot.results.len(), 2);
    }

    #[tokio::test]
    async fn test_gate_abort_on_terminal() {
        let job = JobHandle::new(Uuid::new_v4(), 1);
        job.set_status(ScanStatus::Running);
        assert_eq!(job.gate().await, Gate::Proceed);

        job.set_status(ScanStatus::Stopped);
        assert_eq!(job.gate().await, Gate::Abort);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_spins_while_paused() {
        let job = Arc::new(JobHandle::new(Uuid::new_v4(), 1));
        job.set_status(ScanStatus::Running);
        job.set_status(ScanStatus::Paused);

        let waiter = {
            let job = job.clone();
            tokio::spawn(async move { job.gate().await })
        };

        // Let the waiter spin a few poll cycles, then resume
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!waiter.is_finished());
        job.set_status(ScanStatus::Running);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(waiter.await.unwrap(), Gate::Proceed);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ScanRegistry::new();
        let job = Arc::new(JobHandle::new(Uuid::new_v4(), 1));
        let id = job.id;
        registry.insert(job);

        assert!(registry.get(&id).is_some());
        assert!(registry.get(&Uuid::new_v4()).is_none());
        assert_eq!(registry.ids(), vec![id]);
    }

    #[test]
    fn test_registry_pause_resume_stop() {
        let registry = ScanRegistry::new();
        let job = Arc::new(JobHandle::new(Uuid::new_v4(), 1));
        let id = job.id;
        job.set_status(ScanStatus::Running);
        registry.insert(job);

        assert!(registry.pause(&id));
        assert!(registry.resume(&id));
        assert!(registry.stop(&id));
        assert!(!registry.pause(&id));
        assert!(!registry.stop(&Uuid::new_v4()));
    }
}
