//! Replay driver, background sweeper, and store inspection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mcsupport_core::{Clock, LogRotationPolicy, ManualClock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::artifact_fetcher::ArtifactFetcher;
use crate::artifact_store::{ArtifactStore, TranscriptStoreInspectReport};
use crate::correlation_engine::{Attribution, CorrelationEngine, SweepReport, UploadOutcome};
use crate::participant_roles::StaticPrivilegedRoster;
use crate::transcript_config::TranscriptConfig;
use crate::transcript_contract::TranscriptIngressEvent;
use crate::transcript_event_log::TranscriptEventLog;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Counters produced by [`run_transcript_replay`].
pub struct TranscriptReplaySummary {
    pub events: usize,
    pub uploads_created: usize,
    pub uploads_reused: usize,
    pub uploads_rejected: usize,
    pub uploads_rolled_back: usize,
    pub uploads_persist_failed: usize,
    pub messages_single: usize,
    pub messages_broadcast: usize,
    pub messages_deferred: usize,
    pub messages_unattributed: usize,
    pub sessions_evicted: usize,
    pub pending_discarded: usize,
    pub active_sessions: usize,
    pub pending_messages: usize,
}

impl TranscriptReplaySummary {
    fn record_upload(&mut self, outcome: &UploadOutcome) {
        let counter = match outcome {
            UploadOutcome::Created { .. } => &mut self.uploads_created,
            UploadOutcome::Reused { .. } => &mut self.uploads_reused,
            UploadOutcome::Rejected(_) => &mut self.uploads_rejected,
            UploadOutcome::RolledBack { .. } => &mut self.uploads_rolled_back,
            UploadOutcome::PersistenceFailed { .. } => &mut self.uploads_persist_failed,
        };
        *counter = counter.saturating_add(1);
    }

    fn record_attribution(&mut self, attribution: &Attribution) {
        let counter = match attribution {
            Attribution::Single(_) => &mut self.messages_single,
            Attribution::Broadcast(_) => &mut self.messages_broadcast,
            Attribution::Deferred => &mut self.messages_deferred,
            Attribution::None => &mut self.messages_unattributed,
        };
        *counter = counter.saturating_add(1);
    }

    fn record_sweep(&mut self, report: &SweepReport) {
        self.sessions_evicted = self.sessions_evicted.saturating_add(report.evicted.len());
        self.pending_discarded = self
            .pending_discarded
            .saturating_add(report.discarded_pending.len());
    }
}

/// Opens the store under `state_dir` and wires an engine with the static
/// helper roster and the rotating event log.
pub fn build_correlation_engine(
    state_dir: &Path,
    config: TranscriptConfig,
    fetcher: Arc<dyn ArtifactFetcher>,
    clock: Arc<dyn Clock>,
) -> Result<CorrelationEngine> {
    let store = ArtifactStore::open(state_dir)
        .with_context(|| format!("failed to open transcript store {}", state_dir.display()))?;
    let event_log = TranscriptEventLog::new(
        &store.events_log_path(),
        LogRotationPolicy::from_env(),
    );
    let roster = StaticPrivilegedRoster::from_config(&config);
    Ok(
        CorrelationEngine::new(config, store, fetcher, Arc::new(roster), clock)
            .with_event_log(event_log),
    )
}

/// Feeds recorded ingress events through `engine`, moving `clock` to each
/// event's timestamp first. Time never moves backwards.
pub async fn run_transcript_replay(
    engine: &CorrelationEngine,
    clock: &ManualClock,
    events: &[TranscriptIngressEvent],
) -> TranscriptReplaySummary {
    let mut summary = TranscriptReplaySummary::default();
    for event in events {
        clock.set(event.timestamp_ms().max(clock.now_unix_ms()));
        summary.record_sweep(&engine.sweep());
        match event {
            TranscriptIngressEvent::Upload(upload) => {
                let outcome = engine
                    .register_upload(&upload.room_id, &upload.uploader_id, &upload.file)
                    .await;
                summary.record_upload(&outcome);
            }
            TranscriptIngressEvent::Message(message) => {
                let attribution = engine.handle_message(&message.event).await;
                summary.record_attribution(&attribution);
            }
        }
        summary.events = summary.events.saturating_add(1);
    }
    summary.active_sessions = engine.session_count();
    summary.pending_messages = engine.pending_len();
    tracing::debug!(
        events = summary.events,
        active_sessions = summary.active_sessions,
        pending_messages = summary.pending_messages,
        "transcript replay complete"
    );
    summary
}

pub fn inspect_transcript_store(state_dir: &Path) -> Result<TranscriptStoreInspectReport> {
    let store = ArtifactStore::open(state_dir)
        .with_context(|| format!("failed to open transcript store {}", state_dir.display()))?;
    store
        .inspect()
        .with_context(|| format!("failed to inspect transcript store {}", state_dir.display()))
}

#[derive(Debug)]
/// Handle for the periodic sweep task.
pub struct TranscriptSweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TranscriptSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns a task that sweeps `engine` every `interval` until shut down.
pub fn start_transcript_sweeper(
    engine: Arc<CorrelationEngine>,
    interval: Duration,
) -> Result<TranscriptSweeperHandle> {
    if interval.is_zero() {
        anyhow::bail!("transcript sweep interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("transcript sweeper requires an active Tokio runtime")?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(async move {
        run_transcript_sweep_loop(engine, interval, shutdown_rx).await;
    });
    Ok(TranscriptSweeperHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_transcript_sweep_loop(
    engine: Arc<CorrelationEngine>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = engine.sweep();
                if !report.is_empty() {
                    tracing::debug!(
                        evicted = report.evicted.len(),
                        discarded_pending = report.discarded_pending.len(),
                        "transcript sweep retired state"
                    );
                }
            }
            _ = &mut shutdown_rx => {
                tracing::debug!("transcript sweeper stopped");
                break;
            }
        }
    }
}
