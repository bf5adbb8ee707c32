pub mod config;
pub mod error;
pub mod job;
pub mod namespace;
pub mod command;
pub mod invoker;
pub mod store;
pub mod publisher;
pub mod orchestrator;
pub mod inbox;
pub mod owner;

pub use config::{NameFallback, PipelineConfig};
pub use error::{FailureKind, FailureReason, PipelineError};
pub use job::{Job, JobState, JobStatus};
pub use invoker::{FfmpegInvoker, Invoker, ToolVersion};
pub use orchestrator::Pipeline;
pub use owner::JobOwner;
