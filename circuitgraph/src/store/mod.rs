//! Graph Store Abstraction
//!
//! The pipeline talks to a graph database through two logical operations,
//! both idempotent upserts:
//!
//! - **merge vertex**: create the component keyed by (diagram uuid, local id)
//!   if absent, otherwise match the existing one.
//! - **merge edge**: match both endpoints by (diagram uuid, local id) and
//!   create the connection between them if absent. A missing endpoint is
//!   reported as [`StoreError::NoMatch`].
//!
//! Every committer worker opens its own [`GraphSession`] and holds it for
//! its whole lifetime, so sessions are never shared between tasks.
//!
//! Supported backends:
//! - In-memory petgraph ([`MemoryGraphStore`])
//! - SQLite ([`SqliteGraphStore`])
//! - Neo4j over its HTTP transaction API ([`Neo4jStore`])

pub mod memory;
pub mod neo4j;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::parser::schema::Element;

pub use memory::{CircuitTopology, CommitCall, CommitOp, CommitStage, FailureInjector, MemoryGraphStore};
pub use neo4j::{Neo4jConfig, Neo4jStore};
pub use sqlite::SqliteGraphStore;

/// Identity the store assigned to a committed vertex or edge.
pub type StoreId = i64;

/// Store-level failure for one commit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum StoreError {
    #[error("no vertex matches {uuid}:{local_id}")]
    NoMatch { uuid: String, local_id: u32 },
    #[error("connection {id} is missing its {end} reference")]
    Dangling { id: u32, end: &'static str },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Backend(String),
    #[error("cancelled before commit")]
    Cancelled,
}

/// A graph database the pipeline can commit to.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Open a dedicated session for one worker.
    async fn open_session(&self) -> Result<Box<dyn GraphSession>, StoreError>;
}

/// One worker's connection to the store.
#[async_trait]
pub trait GraphSession: Send {
    /// Create-if-absent-else-match the component vertex of `element`.
    async fn merge_vertex(&mut self, element: &Element) -> Result<StoreId, StoreError>;

    /// Create-if-absent-else-match the connection edge of `element`.
    async fn merge_edge(&mut self, element: &Element) -> Result<StoreId, StoreError>;

    /// Release the session. Called exactly once, also during unwinding.
    fn release(&mut self);
}

/// Both endpoints of a connection, or the reason it has none.
pub(crate) fn edge_endpoints(element: &Element) -> Result<(u32, u32), StoreError> {
    let source = element.source_id().ok_or(StoreError::Dangling {
        id: element.id,
        end: "source",
    })?;
    let target = element.target_id().ok_or(StoreError::Dangling {
        id: element.id,
        end: "target",
    })?;
    Ok((source, target))
}
