//! Bounded, concurrency-limited command execution.

mod dispatcher;
mod job;
mod registry;

pub use dispatcher::{CommandDispatcher, DispatcherConfig, DispatcherTask};
pub use job::{
    Attachment, CommandOutput, CommandRequest, CommandResult, ExecutionContext, Job, JobHandle,
};
pub use registry::CommandRegistry;
