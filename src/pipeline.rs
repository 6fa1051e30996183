//! Job-processing pipeline.
//!
//! One poll cycle walks a single message through
//! `MessageReceived -> JobDecoded -> InputFetched -> Converted ->
//! OutputUploaded -> Completed`, or ends in `Failed` from any stage after
//! the message was received. The input message is deleted only after the
//! completion message has been sent, so a crash anywhere before that point
//! leaves the job to be redelivered once its lease expires. Redelivery is
//! safe: the output object is overwritten with identical bytes and
//! consumers of the output queue de-duplicate by job id.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::converter::ConverterInvoker;
use crate::error::{JobError, JobResult, QueueResult};
use crate::job::JobRecord;
use crate::queue::{QueueClient, QueueMessage};
use crate::retry::{retry_transient, RetryConfig};
use crate::store::ObjectStore;
use crate::telemetry;

/// Heartbeat is logged every this many processed messages.
const HEARTBEAT_EVERY: u64 = 10;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub input_queue: String,
    pub output_queue: String,
    pub dead_letter_queue: Option<String>,
    pub visibility_timeout: Duration,
    /// A failing message is removed once it has been received this many times.
    pub max_receive_count: u32,
    pub scratch_dir: PathBuf,
    /// Names this worker's subdirectory of `scratch_dir`. Workers sharing a
    /// scratch root must use distinct names.
    pub worker_name: String,
    pub retry: RetryConfig,
    /// Pause after a failed receive before polling again.
    pub poll_error_backoff: Duration,
}

/// Last state a message reached in the poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    MessageReceived,
    JobDecoded,
    InputFetched,
    Converted,
    OutputUploaded,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::MessageReceived => "message_received",
            Stage::JobDecoded => "job_decoded",
            Stage::InputFetched => "input_fetched",
            Stage::Converted => "converted",
            Stage::OutputUploaded => "output_uploaded",
            Stage::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// What happened to the input message of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Left in the queue; it comes back when its lease expires.
    Released,
    /// Copied to the dead-letter queue, then deleted.
    DeadLettered,
    /// Deleted without a dead-letter queue to route it to.
    Discarded,
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The queue was empty.
    Idle,
    /// Output uploaded, `done` sent and the input message deleted.
    Completed { job: JobRecord },
    /// Output uploaded but the `done` message could not be sent. The input
    /// message is kept so the job is redone after its lease expires.
    Unacknowledged { job: JobRecord },
    Failed {
        /// The decoded job, if the body could be decoded at all.
        job: Option<JobRecord>,
        stage: Stage,
        error: String,
        disposition: Disposition,
    },
}

impl PollOutcome {
    pub fn job_id(&self) -> Option<i64> {
        match self {
            PollOutcome::Idle => None,
            PollOutcome::Completed { job } | PollOutcome::Unacknowledged { job } => Some(job.id),
            PollOutcome::Failed { job, .. } => job.as_ref().map(|job| job.id),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PollOutcome::Idle => None,
            PollOutcome::Completed { .. } => Some(Stage::Completed),
            PollOutcome::Unacknowledged { .. } => Some(Stage::OutputUploaded),
            PollOutcome::Failed { stage, .. } => Some(*stage),
        }
    }
}

struct Failure {
    stage: Stage,
    error: JobError,
    job: Option<JobRecord>,
}

/// Single sequential worker over one input queue and one output queue.
pub struct Pipeline {
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn ObjectStore>,
    converter: ConverterInvoker,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn ObjectStore>,
        converter: ConverterInvoker,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            queue,
            store,
            converter,
            settings,
        }
    }

    /// Polls until `shutdown` resolves.
    ///
    /// Shutdown interrupts a receive wait but never a job in progress.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut processed = 0u64;

        info!("Polling {} -> {}", self.settings.input_queue, self.settings.output_queue);

        loop {
            let received = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                received = self.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    self.process(message).await;
                    processed += 1;
                    if processed % HEARTBEAT_EVERY == 0 {
                        telemetry::record_worker_heartbeat(processed);
                    }
                }
                // Receives normally block; yield so an instant empty reply cannot starve the runtime.
                Ok(None) => tokio::task::yield_now().await,
                Err(e) => {
                    error!("Failed to receive from {}: {}", self.settings.input_queue, e);
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.settings.poll_error_backoff) => {}
                    }
                }
            }
        }

        info!("Pipeline stopped after {} messages", processed);
    }

    /// Runs one poll cycle: receive at most one message and carry it to a
    /// terminal state.
    pub async fn poll_once(&self) -> QueueResult<PollOutcome> {
        match self.receive().await? {
            Some(message) => Ok(self.process(message).await),
            None => Ok(PollOutcome::Idle),
        }
    }

    async fn receive(&self) -> QueueResult<Option<QueueMessage>> {
        self.queue
            .receive_one(&self.settings.input_queue, self.settings.visibility_timeout)
            .await
    }

    async fn process(&self, message: QueueMessage) -> PollOutcome {
        let started = Instant::now();
        debug!(
            handle = %message.handle,
            receive_count = message.receive_count,
            "Message received"
        );

        let outcome = match self.execute(&message).await {
            Ok(job) => self.complete(job, &message).await,
            Err(failure) => self.fail(failure, &message).await,
        };

        telemetry::record_job_telemetry(&outcome, message.receive_count, started.elapsed());
        outcome
    }

    /// Decodes the job and drives it up to `OutputUploaded`.
    async fn execute(&self, message: &QueueMessage) -> Result<JobRecord, Failure> {
        let undecoded = |error| Failure {
            stage: Stage::MessageReceived,
            error,
            job: None,
        };

        let mut job = JobRecord::decode(&message.body).map_err(undecoded)?;
        // A record that is not pending is not echoed back: marking it failed
        // would move its status backwards.
        job.start_processing().map_err(undecoded)?;

        info!(
            job_id = job.id,
            converter = %job.converter_name,
            filename = %job.input_filename,
            "Processing job"
        );

        let mut stage = Stage::JobDecoded;
        match self.drive(&job, &mut stage).await {
            Ok(()) => Ok(job),
            Err(error) => Err(Failure {
                stage,
                error,
                job: Some(job),
            }),
        }
    }

    async fn drive(&self, job: &JobRecord, stage: &mut Stage) -> JobResult<()> {
        job.validate()?;
        let executable = self.converter.resolve(&job.converter_name)?.to_path_buf();

        let job_dir = self.job_dir(job.id);
        let input_path = job_dir.join("models").join(job.scratch_filename()?);
        let output_path = job_dir.join("gcode").join(format!("{}.gcode", job.id));

        let input_key = job.input_key();
        let model = retry_transient(&self.settings.retry, "fetch input", || {
            self.store.get(&input_key)
        })
        .await?;
        for dir in [input_path.parent(), output_path.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&input_path, &model).await?;
        *stage = Stage::InputFetched;
        debug!(job_id = job.id, key = %input_key, bytes = model.len(), "Input fetched");

        self.converter
            .run(&executable, &input_path, &output_path)
            .await?;
        *stage = Stage::Converted;

        let artifact = tokio::fs::read(&output_path).await?;
        let output_key = job.output_key();
        retry_transient(&self.settings.retry, "upload output", || {
            self.store.put(&output_key, artifact.clone())
        })
        .await?;
        *stage = Stage::OutputUploaded;
        debug!(job_id = job.id, key = %output_key, bytes = artifact.len(), "Output uploaded");

        Ok(())
    }

    async fn complete(&self, mut job: JobRecord, message: &QueueMessage) -> PollOutcome {
        let body = match job.mark_done().and_then(|()| job.encode()) {
            Ok(body) => body,
            Err(error) => {
                let failure = Failure {
                    stage: Stage::OutputUploaded,
                    error,
                    job: Some(job),
                };
                return self.fail(failure, message).await;
            }
        };

        let sent = retry_transient(&self.settings.retry, "send completion", || {
            self.queue.send(&self.settings.output_queue, &body)
        })
        .await;
        if let Err(e) = sent {
            warn!(
                job_id = job.id,
                error = %e,
                "Completion not sent, leaving message for redelivery"
            );
            return PollOutcome::Unacknowledged { job };
        }

        let deleted = retry_transient(&self.settings.retry, "delete message", || {
            self.queue.delete(&self.settings.input_queue, &message.handle)
        })
        .await;
        if let Err(e) = deleted {
            // The job is done; a redelivery will redo it idempotently.
            warn!(job_id = job.id, error = %e, "Failed to delete completed message");
        }

        self.remove_job_dir(job.id).await;
        info!(job_id = job.id, key = %job.output_key(), "Job completed");
        PollOutcome::Completed { job }
    }

    async fn fail(&self, failure: Failure, message: &QueueMessage) -> PollOutcome {
        let Failure {
            stage,
            error,
            mut job,
        } = failure;

        error!(
            job_id = ?job.as_ref().map(|job| job.id),
            stage = %stage,
            receive_count = message.receive_count,
            bad_shape = error.is_bad_shape(),
            error = %error,
            "Job failed"
        );

        if let Some(record) = job.as_mut() {
            self.notify_failed(record).await;
        }

        let disposition = if message.receive_count >= self.settings.max_receive_count {
            self.dead_letter(message).await
        } else {
            Disposition::Released
        };

        PollOutcome::Failed {
            job,
            stage,
            error: error.to_string(),
            disposition,
        }
    }

    /// Best-effort `failed` message so downstream is not left waiting.
    async fn notify_failed(&self, job: &mut JobRecord) {
        let body = match job.mark_failed().and_then(|()| job.encode()) {
            Ok(body) => body,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Cannot build failure message");
                return;
            }
        };

        let sent = retry_transient(&self.settings.retry, "send failure", || {
            self.queue.send(&self.settings.output_queue, &body)
        })
        .await;
        if let Err(e) = sent {
            warn!(job_id = job.id, error = %e, "Failed to send failure message");
        }
    }

    /// Removes a message that keeps failing, routing it to the dead-letter
    /// queue first when one is configured.
    async fn dead_letter(&self, message: &QueueMessage) -> Disposition {
        let mut disposition = Disposition::Discarded;

        if let Some(dlq) = &self.settings.dead_letter_queue {
            let routed = retry_transient(&self.settings.retry, "dead-letter message", || {
                self.queue.send(dlq, &message.body)
            })
            .await;
            if let Err(e) = routed {
                warn!(handle = %message.handle, error = %e, "Dead-lettering failed, keeping message");
                return Disposition::Released;
            }
            disposition = Disposition::DeadLettered;
        }

        let deleted = retry_transient(&self.settings.retry, "delete message", || {
            self.queue.delete(&self.settings.input_queue, &message.handle)
        })
        .await;
        match deleted {
            Ok(()) => {
                warn!(
                    handle = %message.handle,
                    receive_count = message.receive_count,
                    "Message removed after repeated failures"
                );
                disposition
            }
            Err(e) => {
                warn!(handle = %message.handle, error = %e, "Failed to delete failing message");
                Disposition::Released
            }
        }
    }

    /// `<scratch_dir>/<worker_name>/<job_id>`: a redelivered job running on
    /// another worker never shares files with this one.
    fn job_dir(&self, job_id: i64) -> PathBuf {
        self.settings
            .scratch_dir
            .join(&self.settings.worker_name)
            .join(job_id.to_string())
    }

    async fn remove_job_dir(&self, job_id: i64) {
        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clean scratch dir {}: {}", dir.display(), e),
        }
    }
}
