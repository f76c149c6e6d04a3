//! Task Backend (spec.md §4.9)
//!
//! Abstract FIFO queue with batched in-flight accounting: a `TaskBackend`
//! trait with a synchronous `InlineBackend` and an async, batch-draining
//! `ConcurrentBackend`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::error::EngineError;
use crate::retain::RetainItem;

/// A tagged-variant background job (spec.md §9 "Dynamic dictionaries →
/// typed records": internal tasks stay a small tagged-variant type so the
/// backend stays schema-stable across implementations).
#[derive(Debug, Clone)]
pub enum Task {
    /// Runs the Retain Pipeline's async entry point for an already-recorded
    /// operation. Carries the request payload directly since tasks are
    /// in-process channel messages, not a wire format (spec.md §4.9's async
    /// `retain` entry point).
    BatchPut {
        operation_id: Uuid,
        bank_id: String,
        items: Vec<RetainItem>,
        document_id: Option<String>,
    },
    /// Runs the Observation Consolidator for one entity.
    RefreshObservation {
        bank_id: String,
        entity_id: Uuid,
    },
}

impl Task {
    pub fn bank_id(&self) -> &str {
        match self {
            Task::BatchPut { bank_id, .. } => bank_id,
            Task::RefreshObservation { bank_id, .. } => bank_id,
        }
    }

    pub fn operation_id(&self) -> Option<Uuid> {
        match self {
            Task::BatchPut { operation_id, .. } => Some(*operation_id),
            Task::RefreshObservation { .. } => None,
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
/// Executor callback bound by the engine (spec.md §4.9 "an executor
/// callback bound by the engine").
pub type Executor = Arc<dyn Fn(Task) -> BoxFuture<Result<(), EngineError>> + Send + Sync>;

/// Abstract task queue interface (spec.md §4.9).
#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn set_executor(&mut self, executor: Executor);
    async fn initialize(&self) -> Result<(), EngineError>;
    async fn submit(&self, task: Task) -> Result<(), EngineError>;
    async fn shutdown(&self) -> Result<(), EngineError>;
}

async fn execute_task(executor: &Executor, task: Task) {
    let bank_id = task.bank_id().to_string();
    let operation_id = task.operation_id();
    if let Err(err) = executor(task).await {
        tracing::error!(bank_id, ?operation_id, error = %err, "task execution failed");
    }
}

/// Executes on the caller; `shutdown` is a no-op. Used for CLI and
/// embedded use to avoid background threads (spec.md §4.9 "Inline").
#[derive(Default)]
pub struct InlineBackend {
    executor: Option<Executor>,
}

impl InlineBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskBackend for InlineBackend {
    fn set_executor(&mut self, executor: Executor) {
        self.executor = Some(executor);
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn submit(&self, task: Task) -> Result<(), EngineError> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| EngineError::Fatal("InlineBackend has no executor bound".into()))?;
        execute_task(executor, task).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct SharedState {
    executor: Mutex<Option<Executor>>,
    /// Tasks accepted by `submit` but not yet finished executing — covers
    /// both the time a task spends sitting in the channel waiting for the
    /// worker's next `recv()` and the time it spends actually running.
    /// `in_flight` alone only counts the latter, which lets `wait_for_pending`
    /// return while the channel still holds unseen tasks.
    outstanding: AtomicUsize,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Internal FIFO queue; a worker loop drains up to `batch_size` items or
/// waits up to `batch_interval`, whichever comes first, then dispatches
/// them concurrently. Tracks an outstanding count (queued + running) so
/// `wait_for_pending` returns only once every submitted task has actually
/// finished (spec.md §4.9 "Concurrent in-process").
pub struct ConcurrentBackend {
    sender: mpsc::UnboundedSender<Task>,
    shared: Arc<SharedState>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    batch_size: usize,
    batch_interval: Duration,
}

impl ConcurrentBackend {
    pub fn new(batch_size: usize, batch_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            executor: Mutex::new(None),
            outstanding: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        });

        let worker_shared = shared.clone();
        let worker = tokio::spawn(Self::run_worker(receiver, worker_shared, batch_size, batch_interval));

        Self {
            sender,
            shared,
            worker: Mutex::new(Some(worker)),
            batch_size,
            batch_interval,
        }
    }

    async fn run_worker(
        mut receiver: mpsc::UnboundedReceiver<Task>,
        shared: Arc<SharedState>,
        batch_size: usize,
        batch_interval: Duration,
    ) {
        loop {
            let mut batch = VecDeque::new();
            let deadline = tokio::time::Instant::now() + batch_interval;

            match receiver.recv().await {
                Some(task) => batch.push_back(task),
                None => return,
            };
            shared.in_flight.fetch_add(1, Ordering::SeqCst);

            while batch.len() < batch_size {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, receiver.recv()).await {
                    Ok(Some(task)) => {
                        shared.in_flight.fetch_add(1, Ordering::SeqCst);
                        batch.push_back(task);
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            let executor = shared.executor.lock().await.clone();
            if let Some(executor) = executor {
                let mut handles = Vec::with_capacity(batch.len());
                for task in batch {
                    let executor = executor.clone();
                    handles.push(tokio::spawn(async move { execute_task(&executor, task).await }));
                }
                let count = handles.len();
                for handle in handles {
                    let _ = handle.await;
                }
                shared.in_flight.fetch_sub(count, Ordering::SeqCst);
                shared.outstanding.fetch_sub(count, Ordering::SeqCst);
            } else {
                let count = batch.len();
                tracing::error!("ConcurrentBackend has no executor bound, dropping {count} tasks");
                shared.in_flight.fetch_sub(count, Ordering::SeqCst);
                shared.outstanding.fetch_sub(count, Ordering::SeqCst);
            }

            shared.drained.notify_waiters();
        }
    }

    /// Returns only once every task accepted by `submit` has finished
    /// running — gated on `outstanding`, not `in_flight`, since a task sits
    /// in the channel (counted, but not yet running) between `submit` and
    /// the worker's next `recv()` (spec.md §4.9's test hook
    /// `wait_for_pending`).
    pub async fn wait_for_pending(&self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::TransientIo("timed out waiting for pending tasks".into()));
            }
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(50)), self.shared.drained.notified()).await;
        }
    }
}

#[async_trait]
impl TaskBackend for ConcurrentBackend {
    fn set_executor(&mut self, executor: Executor) {
        // `set_executor` is called before the backend is shared, so a
        // blocking lock here never contends with the worker.
        if let Ok(mut guard) = self.shared.executor.try_lock() {
            *guard = Some(executor);
        }
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn submit(&self, task: Task) -> Result<(), EngineError> {
        // Counted here, before the task is even in the channel, so a
        // `wait_for_pending` racing a fresh `submit` never observes a
        // false-empty queue.
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        self.sender.send(task).map_err(|_| {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            EngineError::Fatal("task backend worker has shut down".into())
        })
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.wait_for_pending(Duration::from_secs(120)).await.ok();
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConcurrentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentBackend")
            .field("batch_size", &self.batch_size)
            .field("batch_interval", &self.batch_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    fn counting_executor(counter: Arc<Counter>) -> Executor {
        Arc::new(move |_task: Task| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn inline_backend_executes_synchronously() {
        let counter = Arc::new(Counter::new(0));
        let mut backend = InlineBackend::new();
        backend.set_executor(counting_executor(counter.clone()));
        backend
            .submit(Task::RefreshObservation {
                bank_id: "b1".into(),
                entity_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_backend_drains_batch_and_reports_idle() {
        let counter = Arc::new(Counter::new(0));
        let mut backend = ConcurrentBackend::new(10, Duration::from_millis(50));
        backend.set_executor(counting_executor(counter.clone()));
        backend.initialize().await.unwrap();

        for _ in 0..5 {
            backend
                .submit(Task::RefreshObservation {
                    bank_id: "b1".into(),
                    entity_id: Uuid::new_v4(),
                })
                .await
                .unwrap();
        }

        backend.wait_for_pending(Duration::from_secs(5)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        backend.shutdown().await.unwrap();
    }

    /// On a current-thread runtime `submit().await` never yields to the
    /// worker task, so a task can sit in the channel, uncounted by
    /// `in_flight`, when `wait_for_pending` is called right after submitting.
    /// `outstanding` must count it from the moment `submit` accepts it.
    #[tokio::test]
    async fn wait_for_pending_does_not_return_while_a_task_is_still_queued() {
        let counter = Arc::new(Counter::new(0));
        let mut backend = ConcurrentBackend::new(10, Duration::from_millis(20));
        backend.set_executor(counting_executor(counter.clone()));
        backend.initialize().await.unwrap();

        backend
            .submit(Task::RefreshObservation {
                bank_id: "b1".into(),
                entity_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert_eq!(
            backend.shared.outstanding.load(Ordering::SeqCst),
            1,
            "submit must count the task before the worker ever dequeues it"
        );

        backend.wait_for_pending(Duration::from_secs(5)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(backend.shared.outstanding.load(Ordering::SeqCst), 0);
        backend.shutdown().await.unwrap();
    }
}
