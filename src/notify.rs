//! Job status notifications.
//!
//! The orchestration path hands snapshots to a [`NotificationSink`] and never
//! waits on delivery. [`JobEventPublisher`] queues snapshots on a bounded
//! channel and a background worker fans them out to broadcast subscribers.
//! Delivery is best-effort and at-most-once: a full queue drops the snapshot,
//! and a slow subscriber skips whatever it lagged behind on.

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{config::NotificationConfig, job::Job};

/// Stream of job snapshots handed to subscribers
pub type JobEventStream = BoxStream<'static, Job>;

/// Fire-and-forget sink for job state transitions
pub trait NotificationSink: Send + Sync {
    /// Must return immediately; delivery failures are the sink's problem.
    fn publish(&self, job: &Job);
}

/// Queue-backed broadcast publisher with an explicit start/stop lifecycle
pub struct JobEventPublisher {
    queue_tx: mpsc::Sender<Job>,
    queue_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    events: broadcast::Sender<Job>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobEventPublisher {
    pub fn new(config: &NotificationConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size);
        let (events, _) = broadcast::channel(config.channel_capacity);
        Self {
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            events,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// 启动后台分发任务
    ///
    /// ## 功能说明
    /// 取出队列接收端并启动分发worker，将队列中的任务快照广播给所有订阅者。
    /// 重复调用是无操作
    pub async fn start(&self) {
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            tracing::debug!("job event publisher already started");
            return;
        };

        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = queue_rx.recv() => match next {
                        Some(job) => Self::fan_out(&events, job),
                        None => break,
                    },
                }
            }

            // Deliver whatever was already queued before shutting down.
            while let Ok(job) = queue_rx.try_recv() {
                Self::fan_out(&events, job);
            }
            tracing::info!("job event publisher stopped");
        });

        *self.worker.lock().await = Some(handle);
        tracing::info!("job event publisher started");
    }

    /// Stop the worker after it drains the queue.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "job event publisher worker ended abnormally");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Every snapshot published from now on.
    pub fn subscribe(&self) -> JobEventStream {
        self.stream()
    }

    /// Snapshots of a single job only.
    pub fn subscribe_job(&self, job_id: Uuid) -> JobEventStream {
        self.stream()
            .filter(move |job| futures::future::ready(job.id == job_id))
            .boxed()
    }

    /// Snapshots for every job of one tenant.
    pub fn subscribe_tenant(&self, tenant_id: Uuid) -> JobEventStream {
        self.stream()
            .filter(move |job| futures::future::ready(job.tenant_id == tenant_id))
            .boxed()
    }

    fn stream(&self) -> JobEventStream {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(job) => Some(job),
                    Err(e) => {
                        tracing::warn!(error = %e, "job event subscriber lagged");
                        None
                    }
                }
            })
            .boxed()
    }

    fn fan_out(events: &broadcast::Sender<Job>, job: Job) {
        // An error only means nobody is listening right now.
        if events.send(job).is_err() {
            tracing::trace!("job event dropped: no subscribers");
        }
    }
}

impl NotificationSink for JobEventPublisher {
    fn publish(&self, job: &Job) {
        match self.queue_tx.try_send(job.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(job_id = %job.id, status = %job.status, "notification queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::debug!(job_id = %job.id, "notification queue closed, dropping event");
            }
        }
    }
}

/// Sink that discards everything
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn publish(&self, _job: &Job) {}
}
