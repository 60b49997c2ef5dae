//! # taskhive-worker
//!
//! Worker-side machinery for the taskhive coordination core: executor
//! identity, the poll/claim/drive/release loop, heartbeats, and the
//! janitor that reclaims work from dead peers.
//!
//! The actual work (assessment, execution, analysis, quality gates) is
//! performed by a [`PhaseRunner`] implementation supplied by the
//! embedder; this crate only coordinates.

pub mod config;
pub mod identity;
pub mod janitor;
pub mod phase;
pub mod pipeline;
pub mod poller;
pub mod worker;

pub use config::{LabelHandoff, WorkerConfig};
pub use identity::ExecutorIdentity;
pub use janitor::{Janitor, JanitorSummary};
pub use phase::{ExecutionOutcome, GateOutcome, PhaseContext, PhaseRunner, PhaseToggles};
pub use pipeline::{run_pipeline, PipelineReport};
pub use poller::{PollBackoff, WorkPoller};
pub use worker::Worker;
