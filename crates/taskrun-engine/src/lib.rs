//! TaskRun execution engine.
//!
//! Runs one declared task as an isolated unit of work:
//!
//! 1. resolve the image into a cached root filesystem ([`image`]),
//! 2. bind inputs, caches and outputs into a mount plan ([`volume`]),
//! 3. build a sandbox and run the command in it ([`sandbox`]),
//! 4. persist caches, capture outputs and tear everything down ([`runner`]),
//! 5. summarize the outcome for the caller ([`report`]).

pub mod config;
pub mod engine;
pub mod event;
pub mod fsutil;
pub mod image;
pub mod lock;
pub mod output;
pub mod report;
pub mod retry;
pub mod runner;
pub mod sandbox;
pub mod volume;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, Isolation};
pub use engine::Engine;
pub use event::{EventSink, OutputStream, TaskEvent};
pub use image::{DirectoryRegistry, ImageResolver, ImageStore, Registry, RegistryError, ResolvedImage};
pub use lock::{CacheLockGuard, CacheLocks, LockError};
pub use report::{report, Report, ResultReporter, Verdict};
pub use retry::RetryPolicy;
pub use runner::TaskRunner;
pub use sandbox::{
    default_backend, DirectoryBackend, RunCommand, RunControl, RunExit, RunReport,
    SandboxBackend, SandboxError, SandboxHandle,
};
pub use volume::{Mount, MountPlan, VolumeSet};
