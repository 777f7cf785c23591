use serde::Serialize;

/// Core error type for infrastructure failures.
///
/// These never reach a user verbatim: the pipeline maps them into a
/// [`CommandFailure`] with a generic message and logs the detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("shared store error: {0}")]
    Store(String),

    #[error("interactive channel error: {0}")]
    Channel(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a cancelled command had started running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPhase {
    NotStarted,
    Aborted,
}

/// Why a command did not produce a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "phase")]
pub enum FailureReason {
    /// Rate limited. A control outcome rather than an error.
    AdmissionDenied,
    CredentialNotFound,
    CredentialTimeout,
    CredentialInvalid,
    Overloaded,
    DownstreamExecutionFailure,
    Cancelled(CancelPhase),
    UnknownCommand,
    ShuttingDown,
}

/// Structured, user-presentable failure of a command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    #[serde(flatten)]
    pub reason: FailureReason,
    pub message: String,
}

impl CommandFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn admission_denied() -> Self {
        Self::new(
            FailureReason::AdmissionDenied,
            "You are sending commands too quickly. Please wait a moment.",
        )
    }

    pub fn overloaded() -> Self {
        Self::new(FailureReason::Overloaded, "Server under high load")
    }

    pub fn shutting_down() -> Self {
        Self::new(
            FailureReason::ShuttingDown,
            "The bot is restarting. Please try again shortly.",
        )
    }

    pub fn cancelled(phase: CancelPhase) -> Self {
        let message = match phase {
            CancelPhase::NotStarted => "Command cancelled before it started",
            CancelPhase::Aborted => "Command cancelled",
        };
        Self::new(FailureReason::Cancelled(phase), message)
    }

    pub fn execution_failed() -> Self {
        Self::new(
            FailureReason::DownstreamExecutionFailure,
            "An unknown error occurred while processing your command",
        )
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::new(
            FailureReason::UnknownCommand,
            format!("No service registered for command {name}"),
        )
    }
}
