//! Turns queue deliveries into pipeline runs.

use crate::command::{Command, DocumentCommand, VideoCommand};
use crate::config::ConvertConfig;
use crate::error::TaskError;
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::task::{CommandKind, ConvertTask};
use crate::telemetry::record_task_telemetry;
use crate::tools::ToolRunner;
use crate::transfer::{Downloader, UploadSession};
use crate::worker::{DeliveryHandler, Disposition};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Instrument};

/// Builds the command for each task and runs it.
pub struct TaskDispatcher {
    config: Arc<ConvertConfig>,
    tools: Arc<dyn ToolRunner>,
    client: Client,
    downloader: Downloader,
    retry: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(config: Arc<ConvertConfig>, tools: Arc<dyn ToolRunner>, client: Client) -> Self {
        Self {
            config,
            tools,
            downloader: Downloader::new(client.clone()),
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn command(&self, kind: CommandKind, worker_id: &str) -> Box<dyn Command> {
        match kind {
            CommandKind::Document => Box::new(DocumentCommand::new(
                Arc::clone(&self.config),
                Arc::clone(&self.tools),
                worker_id,
            )),
            CommandKind::Video => Box::new(VideoCommand::new(
                Arc::clone(&self.config),
                Arc::clone(&self.tools),
            )),
        }
    }

    /// Executes one task with a fresh upload session.
    pub async fn process(&self, task: &ConvertTask, worker_id: &str) -> Result<(), TaskError> {
        let command = self.command(task.command, worker_id);
        let mut session = UploadSession::new(self.client.clone(), task.back_url.clone(), self.retry);

        Pipeline::new(command.as_ref(), &self.downloader, self.retry)
            .execute(task, &mut session)
            .await
    }
}

#[async_trait]
impl DeliveryHandler for TaskDispatcher {
    async fn handle(&self, body: &[u8], queue: &str, worker_id: &str) -> Disposition {
        let task = match ConvertTask::from_slice(body) {
            Ok(task) => task,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to parse message body");
                return Disposition::Reject;
            }
        };

        let span = tracing::info_span!(
            "convert_task",
            request_id = %task.request_id,
            task_id = %task.id,
            queue = %queue,
            command = %task.command,
            worker = %worker_id,
        );

        async {
            info!(file = %task.file, formats = ?task.formats, "Processing task");
            let start = Instant::now();
            let result = self.process(&task, worker_id).await;
            record_task_telemetry(&task, &result, start.elapsed());

            match result {
                Ok(()) => {
                    info!(duration_ms = start.elapsed().as_millis() as u64, "Task completed");
                    Disposition::Ack
                }
                Err(e) => {
                    error!(stage = %e.stage(), error = %e, "Task failed");
                    Disposition::Reject
                }
            }
        }
        .instrument(span)
        .await
    }
}
