//! Background sync worker.
//!
//! A single tokio task per device decides when cycles run: after a quiet
//! period following local writes, on a periodic interval, and on demand
//! (manual sync or end-of-period closeout). Callers talk to it through a
//! [`SchedulerHandle`]; progress is published on a broadcast channel.

use crate::client::{CycleReport, SyncClient};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

const TRIGGER_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Operator asked for a sync now
    Manual,
    /// End-of-period closeout: drain the outbox
    Closeout,
    /// No local write for the idle delay
    Idle,
    Periodic,
}

impl Trigger {
    fn drains(&self) -> bool {
        matches!(self, Trigger::Manual | Trigger::Closeout)
    }
}

/// Status events published by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started { trigger: Trigger },
    Completed { trigger: Trigger, report: CycleReport },
    /// Another process holds the lease
    Skipped { trigger: Trigger, holder: String },
    Failed {
        trigger: Trigger,
        error: String,
        retryable: bool,
    },
    /// Sync is disabled in configuration
    Disabled { trigger: Trigger },
    /// Something an operator has to look at
    Alert { message: String },
}

#[derive(Debug)]
enum Command {
    Trigger(Trigger),
    LocalWrite,
}

/// Cloneable handle to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Request a cycle. Returns `false` once the scheduler has stopped.
    pub async fn trigger(&self, trigger: Trigger) -> bool {
        self.commands.send(Command::Trigger(trigger)).await.is_ok()
    }

    /// Report a local write; restarts the idle timer.
    pub fn notify_write(&self) {
        // a full channel already has a pending wake-up
        let _ = self.commands.try_send(Command::LocalWrite);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stop the worker, cancelling a running cycle, and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sync scheduler task ended abnormally");
            }
        }
    }
}

/// Start the background worker for `client`.
pub fn spawn<T>(client: Arc<SyncClient<T>>, config: Arc<ClientConfig>) -> SchedulerHandle
where
    T: Transport + 'static,
{
    let (commands, command_rx) = mpsc::channel(TRIGGER_CAPACITY);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let worker = Worker {
        client,
        config,
        events: events.clone(),
    };
    let task = tokio::spawn(worker.run(command_rx, shutdown_rx));

    SchedulerHandle {
        commands,
        events,
        shutdown: Arc::new(shutdown),
        task: Arc::new(Mutex::new(Some(task))),
    }
}

struct Worker<T> {
    client: Arc<SyncClient<T>>,
    config: Arc<ClientConfig>,
    events: broadcast::Sender<SyncEvent>,
}

impl<T: Transport + 'static> Worker<T> {
    async fn run(self, mut commands: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.periodic_interval;
        let mut periodic = time::interval_at(Instant::now() + period, period);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_deadline: Option<Instant> = None;

        tracing::info!(
            device_id = %self.config.device_id,
            enabled = self.config.sync_enabled,
            "sync scheduler started"
        );

        loop {
            let idle = async move {
                match idle_deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let trigger = tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(Command::Trigger(trigger)) => trigger,
                    Some(Command::LocalWrite) => {
                        idle_deadline = Some(Instant::now() + self.config.idle_delay);
                        continue;
                    }
                    None => break,
                },
                _ = periodic.tick() => Trigger::Periodic,
                _ = idle => {
                    idle_deadline = None;
                    Trigger::Idle
                }
            };

            let cancelled = tokio::select! {
                biased;
                _ = shutdown.changed() => true,
                _ = self.handle(trigger) => false,
            };
            if cancelled {
                if let Err(e) = self.client.abort_cycle().await {
                    tracing::warn!(error = %e, "failed to clean up cancelled sync cycle");
                }
                break;
            }
        }

        tracing::info!(device_id = %self.config.device_id, "sync scheduler stopped");
    }

    async fn handle(&self, trigger: Trigger) {
        if !self.config.sync_enabled {
            tracing::debug!(?trigger, "sync disabled, trigger ignored");
            self.emit(SyncEvent::Disabled { trigger });
            return;
        }

        self.emit(SyncEvent::Started { trigger });
        let result = if trigger.drains() {
            self.client.drain().await
        } else {
            self.client.run_cycle().await
        };

        match result {
            Ok(report) => {
                if report.abandoned > 0 {
                    self.emit(SyncEvent::Alert {
                        message: format!("{} change(s) abandoned", report.abandoned),
                    });
                }
                self.emit(SyncEvent::Completed { trigger, report });
            }
            Err(e) if e.is_lock_held() => {
                tracing::debug!(?trigger, error = %e, "sync cycle skipped");
                let holder = match e {
                    ClientError::Engine(tillsync_engine::Error::SyncLockHeld { holder }) => {
                        holder
                    }
                    other => other.to_string(),
                };
                self.emit(SyncEvent::Skipped { trigger, holder });
            }
            Err(e) => {
                self.emit(SyncEvent::Failed {
                    trigger,
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
