use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::ResolvedCredential,
    domain::{InteractionRef, Subject},
    errors::CommandFailure,
};

/// What every command eventually resolves to.
pub type CommandResult = std::result::Result<CommandOutput, CommandFailure>;

/// An authenticated command, ready to run.
#[derive(Clone, Debug)]
pub struct CommandRequest {
    /// Registry key of the engine to run (`"genshin character"`, `"hsr notes"`...).
    pub command: String,
    pub subject: Subject,
    pub credential: ResolvedCredential,
    /// Slash-command options as typed by the user.
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub reply_to: InteractionRef,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, credential: ResolvedCredential, reply_to: InteractionRef) -> Self {
        Self {
            command: command.into(),
            subject: credential.subject,
            credential,
            parameters: BTreeMap::new(),
            reply_to,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// A rendered reply: text plus any image cards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub ephemeral: bool,
}

impl CommandOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_attachment(mut self, file_name: impl Into<String>, data: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            file_name: file_name.into(),
            data,
        });
        self
    }
}

/// Per-execution scope handed to an [`ExecutionEngine`](crate::ports::ExecutionEngine).
///
/// Built fresh for every job; nothing in it is shared with other executions.
#[derive(Debug)]
pub struct ExecutionContext {
    pub request: CommandRequest,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

impl ExecutionContext {
    pub(crate) fn new(request: CommandRequest, cancel: CancellationToken) -> Self {
        Self {
            request,
            cancel,
            started_at: Instant::now(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.request.parameters.get(name)
    }

    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameter(name).and_then(|v| v.as_str())
    }
}

/// A command submitted to the dispatcher.
#[derive(Debug)]
pub struct Job {
    pub(crate) request: CommandRequest,
    pub(crate) cancel: CancellationToken,
}

impl Job {
    pub fn new(request: CommandRequest) -> Self {
        Self {
            request,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the job to an existing token (e.g. the interaction's own lifetime).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn request(&self) -> &CommandRequest {
        &self.request
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A job as held by the queue: the reply side of its single-assignment result.
pub(crate) struct QueuedJob {
    pub(crate) job: Job,
    pub(crate) reply: oneshot::Sender<CommandResult>,
    pub(crate) enqueued_at: Instant,
}

impl QueuedJob {
    pub(crate) fn resolve(self, result: CommandResult) {
        // The caller may have dropped its handle; nobody is left to tell.
        let _ = self.reply.send(result);
    }
}

/// Future for a submitted job's result.
///
/// Resolves exactly once. Dropping the handle does not cancel the job; call
/// [`cancel`](Self::cancel) for that.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<CommandResult>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub(crate) fn new(rx: oneshot::Receiver<CommandResult>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Future for JobHandle {
    type Output = CommandResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|res| {
            // The reply sender only disappears without sending if its execution
            // unit died; report that like any other execution failure.
            res.unwrap_or_else(|_| Err(CommandFailure::execution_failed()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, Token, UserId};

    fn request() -> CommandRequest {
        let credential = ResolvedCredential {
            subject: Subject::new(UserId(5), 2),
            account_id: 600_005,
            token: Token("ltoken".into()),
            expires_at: None,
        };
        CommandRequest::new("hsr notes", credential, InteractionRef::new(ChatId(1), "i-9"))
            .with_parameter("server", serde_json::json!("asia"))
    }

    #[test]
    fn job_shares_the_interaction_token() {
        let interaction = CancellationToken::new();
        let job = Job::new(request()).with_cancellation(interaction.clone());

        assert_eq!(job.request().command, "hsr notes");
        assert_eq!(job.request().subject, Subject::new(UserId(5), 2));
        assert!(!job.cancellation_token().is_cancelled());
        interaction.cancel();
        assert!(job.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn handle_reports_a_dead_unit_as_execution_failure() {
        let (reply, rx) = oneshot::channel();
        let handle = JobHandle::new(rx, CancellationToken::new());
        drop(reply);

        assert_eq!(handle.await.unwrap_err(), CommandFailure::execution_failed());
    }
}
