//! # taskhive-storage
//!
//! Transactional persistence for the taskhive coordination core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CoordinationStore                        │
//! │   (issues, dependencies, labels, executors, claims, events)  │
//! └─────────────────────────────────────────────────────────────┘
//!         │                    │                      │
//!         ▼                    ▼                      ▼
//!   SqliteStore          PostgresStore           MemoryStore
//!   (embedded, WAL)      (networked, pooled)     (test double)
//! ```
//!
//! All three backends implement the same trait with the same observable
//! semantics: claims are gated by the uniqueness constraint on the
//! execution-state row, pipeline transitions are compare-and-swap, and
//! compound mutations are atomic.

pub mod memory;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod store;

mod rows;
mod sqlutil;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use store::{
    BlockedIssue, CleanupReport, CoordinationStore, IssueFilter, ReadyFilter, RetentionReport,
    Statistics, TreeNode, REOPEN_MESSAGE,
};
