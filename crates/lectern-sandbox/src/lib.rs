// src/lib.rs
pub mod config;
pub mod error;
pub mod exec;
pub mod jail;
pub mod language;
pub mod limits;
pub mod model;
pub mod queue;
pub mod store;
pub mod system;
pub mod verify;

// Re-exports for users
pub use config::{Backend, SandboxConfig};
pub use error::{SandboxError, SandboxResult};
pub use jail::{Jail, JailPaths};
pub use language::{Language, Registry};
pub use limits::Limits;
pub use model::{
    Check, CheckResults, CheckSet, Lesson, ProgrammingStep, Question, Status, Step, StepFlags,
    Submission, SubmittedKind, SubmittedProgram, SubmittedStep, SubmittedTest, TestStep,
};
pub use queue::{QUEUE_CAPACITY, QueueHandle, VerificationQueue};
pub use store::{MemoryStore, RecordStore};
#[cfg(target_os = "freebsd")]
pub use system::FreeBsdJails;
pub use system::{HostJails, JailId, JailSystem};
pub use verify::{Verifier, normalize};
