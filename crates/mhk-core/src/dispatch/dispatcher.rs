use std::sync::Arc;

use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, OwnedSemaphorePermit, Semaphore,
    },
    task::{JoinError, JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{
    job::{CommandResult, ExecutionContext, Job, JobHandle, QueuedJob},
    registry::CommandRegistry,
};
use crate::{
    domain::Subject,
    errors::{CancelPhase, CommandFailure, Error, Result},
    metrics::{CommandTimer, MetricsSink, Outcome},
    ports::ExecutionEngine,
};

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// Executions allowed to run at the same time.
    pub max_concurrency: usize,
    /// Jobs that may wait for a free slot before submissions are rejected.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            queue_capacity: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config(
                "dispatcher max_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "dispatcher queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Submission side of the dispatcher. Cheap to clone.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    tx: mpsc::Sender<QueuedJob>,
}

/// The running consumption loop.
///
/// Stops when [`shutdown`](Self::shutdown) is called or every
/// [`CommandDispatcher`] clone has been dropped.
#[derive(Debug)]
pub struct DispatcherTask {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl DispatcherTask {
    /// Reject everything still queued and wait for in-flight executions.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Dispatcher loop ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl CommandDispatcher {
    /// Spawn the consumption loop on the current runtime.
    pub fn start(
        config: DispatcherConfig,
        registry: CommandRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<(Self, DispatcherTask)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shutdown = CancellationToken::new();
        let worker = Worker {
            rx,
            registry: Arc::new(registry),
            metrics,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            units: JoinSet::new(),
        };

        tracing::info!(
            max_concurrency = config.max_concurrency,
            queue_capacity = config.queue_capacity,
            "Command dispatcher started"
        );
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        Ok((Self { tx }, DispatcherTask { handle, shutdown }))
    }

    /// Enqueue a job without waiting.
    ///
    /// A full queue resolves the returned handle with `Overloaded` right away;
    /// jobs already queued are unaffected.
    pub fn submit(&self, job: Job) -> JobHandle {
        let (reply, rx) = oneshot::channel();
        let handle = JobHandle::new(rx, job.cancellation_token());

        let queued = QueuedJob {
            job,
            reply,
            enqueued_at: Instant::now(),
        };

        if queued.job.cancel.is_cancelled() {
            queued.resolve(Err(CommandFailure::cancelled(CancelPhase::NotStarted)));
            return handle;
        }

        match self.tx.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) => {
                let request = queued.job.request();
                tracing::warn!(
                    command = %request.command,
                    subject = %request.subject,
                    "Command queue full, rejecting"
                );
                queued.resolve(Err(CommandFailure::overloaded()));
            }
            Err(TrySendError::Closed(queued)) => {
                queued.resolve(Err(CommandFailure::shutting_down()));
            }
        }

        handle
    }

    /// Jobs waiting in the queue right now.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

struct Worker {
    rx: mpsc::Receiver<QueuedJob>,
    registry: Arc<CommandRegistry>,
    metrics: Arc<dyn MetricsSink>,
    permits: Arc<Semaphore>,
    units: JoinSet<()>,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(res) = self.units.join_next(), if !self.units.is_empty() => reap(res),
                next = self.rx.recv() => match next {
                    Some(queued) => self.dispatch(queued, &shutdown).await,
                    None => break,
                },
            }
        }
        self.drain().await;
        tracing::info!("Command dispatcher stopped");
    }

    /// Wait for a slot (in FIFO order), then hand the job to its own unit.
    async fn dispatch(&mut self, queued: QueuedJob, shutdown: &CancellationToken) {
        let cancel = queued.job.cancel.clone();
        if cancel.is_cancelled() {
            queued.resolve(Err(CommandFailure::cancelled(CancelPhase::NotStarted)));
            return;
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                queued.resolve(Err(CommandFailure::shutting_down()));
                return;
            }
            _ = cancel.cancelled() => {
                queued.resolve(Err(CommandFailure::cancelled(CancelPhase::NotStarted)));
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    queued.resolve(Err(CommandFailure::shutting_down()));
                    return;
                }
            },
        };

        tracing::debug!(
            command = %queued.job.request.command,
            waited_ms = queued.enqueued_at.elapsed().as_millis() as u64,
            "Dispatching command"
        );
        let engine = self.registry.get(&queued.job.request.command);
        self.units
            .spawn(execute(queued, engine, self.metrics.clone(), permit));
    }

    async fn drain(mut self) {
        self.rx.close();
        let mut rejected = 0usize;
        while let Some(queued) = self.rx.recv().await {
            queued.resolve(Err(CommandFailure::shutting_down()));
            rejected += 1;
        }
        if rejected > 0 {
            tracing::info!(rejected, "Rejected queued commands on shutdown");
        }
        while let Some(res) = self.units.join_next().await {
            reap(res);
        }
    }
}

fn reap(res: std::result::Result<(), JoinError>) {
    if let Err(e) = res {
        tracing::error!(error = %e, "Execution unit failed");
    }
}

/// One execution unit. Holds its slot until the result has been delivered.
async fn execute(
    queued: QueuedJob,
    engine: Option<Arc<dyn ExecutionEngine>>,
    metrics: Arc<dyn MetricsSink>,
    _permit: OwnedSemaphorePermit,
) {
    let QueuedJob { job, reply, .. } = queued;
    let command = job.request.command.clone();

    let result = run_job(job, engine, metrics.clone()).await;

    let outcome = if result.is_ok() {
        Outcome::Success
    } else {
        Outcome::Failure
    };
    metrics.increment_count(&command, outcome);

    if reply.send(result).is_err() {
        tracing::debug!(command = %command, "Caller went away before the result was ready");
    }
}

async fn run_job(
    job: Job,
    engine: Option<Arc<dyn ExecutionEngine>>,
    metrics: Arc<dyn MetricsSink>,
) -> CommandResult {
    let Job { request, cancel } = job;
    if cancel.is_cancelled() {
        return Err(CommandFailure::cancelled(CancelPhase::NotStarted));
    }

    let Some(engine) = engine else {
        tracing::warn!(command = %request.command, "No engine registered for command");
        return Err(CommandFailure::unknown_command(&request.command));
    };

    let command = request.command.clone();
    let subject = request.subject;
    let ctx = ExecutionContext::new(request, cancel.clone());
    let _timer = CommandTimer::start(metrics, command.clone());

    // Inner task so a panicking engine surfaces as a JoinError here.
    let mut task = tokio::spawn(async move { engine.execute(ctx).await });

    tokio::select! {
        biased;
        joined = &mut task => match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(classify(&command, subject, err)),
            Err(e) => {
                tracing::error!(command = %command, %subject, error = %e, "Command engine panicked");
                Err(CommandFailure::execution_failed())
            }
        },
        _ = cancel.cancelled() => {
            task.abort();
            // Keep the slot until the aborted engine has actually stopped.
            let _ = task.await;
            tracing::info!(command = %command, %subject, "Command cancelled while running");
            Err(CommandFailure::cancelled(CancelPhase::Aborted))
        }
    }
}

fn classify(command: &str, subject: Subject, err: anyhow::Error) -> CommandFailure {
    match err.downcast::<CommandFailure>() {
        Ok(failure) => failure,
        Err(err) => {
            tracing::error!(command, %subject, error = ?err, "Command execution failed");
            CommandFailure::execution_failed()
        }
    }
}
