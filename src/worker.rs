//! Worker loop and dispatch
//!
//! One worker task consumes the queue and runs jobs strictly one at a time.
//! The task handle sits behind [`WorkerGuard`], whose only entry point is an
//! idempotent `ensure_started`; a finished or crashed worker is restarted on
//! the next submission. Job failures and panics never end the loop.

use crate::chat_sync::ChatStore;
use crate::config::Config;
use crate::controller::RetryController;
use crate::job::{Job, JobOutcome, QueueEntry};
use crate::notify::{self, AgentEvent, Notifier};
use crate::queue::JobQueue;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const QUEUED: &str = "Queued";

/// Response to one submission, serialized as `{"message": "Queued"}` or
/// `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Accepted { message: String },
    Rejected { error: String },
}

impl SubmitResponse {
    pub fn queued() -> Self {
        SubmitResponse::Accepted {
            message: QUEUED.to_string(),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        SubmitResponse::Rejected {
            error: error.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitResponse::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub poll_timeout: Duration,
    pub failure_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_timeout: config.queue.poll_timeout(),
            failure_backoff: Duration::from_millis(config.worker.failure_backoff_ms),
        }
    }
}

/// Holds the handle of the running worker task, if any.
#[derive(Default)]
pub struct WorkerGuard {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerGuard {
    /// Spawn a worker with `spawn` unless one is already running.
    /// Returns true when a new worker was started.
    pub fn ensure_started(&self, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        *handle = Some(spawn());
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn take(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    #[cfg(test)]
    fn abort(&self) {
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            handle.abort();
        }
    }
}

struct WorkerContext {
    queue: Arc<JobQueue>,
    controller: Arc<RetryController>,
    notifier: Arc<dyn Notifier>,
    chat_store: Option<Arc<dyn ChatStore>>,
    settings: WorkerSettings,
    /// Entries accepted into the queue, including restored ones.
    admitted: AtomicU64,
    processed: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

/// Owns admission and dispatch: the queue, the worker guard and the
/// shutdown signal.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    guard: WorkerGuard,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<JobQueue>,
        controller: Arc<RetryController>,
        notifier: Arc<dyn Notifier>,
        chat_store: Option<Arc<dyn ChatStore>>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let restored = queue.len() as u64;
        Self {
            ctx: Arc::new(WorkerContext {
                queue,
                controller,
                notifier,
                chat_store,
                settings,
                admitted: AtomicU64::new(restored),
                processed: AtomicU64::new(0),
                shutdown,
            }),
            guard: WorkerGuard::default(),
            shutdown_tx,
        }
    }

    /// Admit `entry` or reject it, then make sure a worker is running.
    /// Never waits for the job itself.
    pub fn submit(&self, entry: QueueEntry) -> SubmitResponse {
        match self.ctx.queue.try_push(entry) {
            Ok(depth) => {
                self.ctx.admitted.fetch_add(1, Ordering::SeqCst);
                debug!(depth, "job queued");
                self.ensure_worker();
                SubmitResponse::queued()
            }
            Err(err) => {
                info!("submission rejected: {}", err);
                SubmitResponse::rejected(err.to_string())
            }
        }
    }

    /// Start the worker if none is running. Returns true if one was started.
    pub fn ensure_worker(&self) -> bool {
        let ctx = self.ctx.clone();
        let started = self
            .guard
            .ensure_started(move || tokio::spawn(worker_loop(ctx)));
        if started {
            info!("worker started");
        }
        started
    }

    pub fn is_worker_running(&self) -> bool {
        self.guard.is_running()
    }

    pub fn pending(&self) -> usize {
        self.ctx.queue.len()
    }

    pub fn processed(&self) -> u64 {
        self.ctx.processed.load(Ordering::SeqCst)
    }

    /// True when every admitted job has reached its terminal event.
    pub fn is_idle(&self) -> bool {
        self.ctx.processed.load(Ordering::SeqCst) >= self.ctx.admitted.load(Ordering::SeqCst)
    }

    /// Wait until the queue drains and the current job finishes.
    pub async fn wait_idle(&self, poll: Duration) {
        while !self.is_idle() {
            tokio::time::sleep(poll).await;
        }
    }

    /// Serve until `input` ends or `interrupt` fires, then stop the worker.
    /// On a clean end of input the queue is drained first. Shutdown always
    /// runs, so the job in flight still gets its terminal event when reading
    /// input fails; that error is returned afterwards.
    pub async fn serve(
        &self,
        input: impl Future<Output = anyhow::Result<()>>,
        interrupt: impl Future<Output = ()>,
        idle_poll: Duration,
    ) -> anyhow::Result<()> {
        let result = tokio::select! {
            result = input => match result {
                Ok(()) => {
                    self.wait_idle(idle_poll).await;
                    Ok(())
                }
                Err(e) => {
                    error!("failed to read submissions: {:#}", e);
                    Err(e)
                }
            },
            _ = interrupt => {
                info!("interrupted, finishing the current job");
                Ok(())
            }
        };
        self.shutdown().await;
        result
    }

    /// Stop the worker after its current job and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.guard.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("worker task ended abnormally: {}", e);
                }
            }
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            entry = ctx.queue.pop_timeout(ctx.settings.poll_timeout) => entry,
        };
        let Some(entry) = next else {
            continue;
        };

        process(&ctx, Job::new(entry)).await;
        ctx.processed.fetch_add(1, Ordering::SeqCst);
    }
    info!("worker stopped");
}

/// Run one job and emit its single terminal event.
async fn process(ctx: &WorkerContext, job: Job) {
    info!(session = %job.session, socket = %job.entry.socket_id, "processing job");
    let run = AssertUnwindSafe(ctx.controller.run(&job)).catch_unwind().await;

    let event = match run {
        Ok(outcome) => terminal_event(ctx, &job, outcome).await,
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(session = %job.session, "job panicked: {}", reason);
            let event = AgentEvent::AgentError {
                pr_url: reason,
                session: None,
                chat: Some(job.entry.chat.clone()),
            };
            notify::emit_to_job(ctx.notifier.as_ref(), &job, &event).await;
            tokio::time::sleep(ctx.settings.failure_backoff).await;
            return;
        }
    };

    info!(session = %job.session, event = event.name(), "emitting terminal event");
    notify::emit_to_job(ctx.notifier.as_ref(), &job, &event).await;
}

async fn terminal_event(ctx: &WorkerContext, job: &Job, outcome: JobOutcome) -> AgentEvent {
    let session = Some(job.session.to_string());
    let mut chat = job.entry.chat.clone();
    match outcome {
        JobOutcome::Published(set) => {
            chat.pull_request_url = set.url.clone();
            if let Some(store) = &ctx.chat_store {
                if let Err(e) = store.save(&job.entry.project_id, &chat).await {
                    warn!(session = %job.session, "failed to save chat: {:#}", e);
                    return AgentEvent::AgentError {
                        pr_url: set.url,
                        session,
                        chat: Some(chat),
                    };
                }
            }
            AgentEvent::PrSubmitted {
                pr_url: set.url,
                session,
                chat,
            }
        }
        JobOutcome::Failed(err) => AgentEvent::AgentError {
            pr_url: err.to_string(),
            session,
            chat: Some(chat),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("internal error: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("internal error: {}", s)
    } else {
        "internal error".to_string()
    }
}
