//! CircuitGraph - draw.io electrical schematic ingestion
//!
//! Reads draw.io (mxGraph) diagrams drawn with the electrical shape
//! library and commits them to a graph store: components (resistors,
//! capacitors, inductors) become vertices, wires become edges between
//! them.
//!
//! # Quick Start
//!
//! ```no_run
//! use circuitgraph::{CircuitGraph, MemoryGraphStore, PipelineOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), circuitgraph::CircuitGraphError> {
//! let service = CircuitGraph::new(Arc::new(MemoryGraphStore::new()), PipelineOptions::default());
//! let result = service.ingest_file(Path::new("circuit.drawio")).await?;
//!
//! for outcome in result.failures() {
//!     println!("{}: {:?}", outcome.element.id, outcome.error());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Streaming parser**: elements are produced while the document is read
//! - **Phase ordering**: no wire is committed before every component has been tried
//! - **Idempotent commits**: re-ingesting a diagram matches existing vertices and edges
//! - **Stores**: in-memory petgraph, SQLite, Neo4j over HTTP

pub mod classifier;
pub mod config;
pub mod core;
pub mod parser;
pub mod pipeline;
pub mod store;

// Re-export main types
pub use crate::core::{
    discover_diagrams, CircuitGraph, CircuitGraphError, ElementClass, IngestResult, IngestStats,
    Inspection,
};
pub use classifier::{Category, Classifier, ClassifyError};
pub use config::{Config, ConfigError, StoreConfig};
pub use parser::{
    DiagramParser, Diagram, Element, ElementError, ElementStream, Link, ParseError, ParserOptions,
    Terminal,
};
pub use pipeline::{
    IngestPipeline, IngestRun, Outcome, PipelineError, PipelineOptions, RunReport, UnsupportedPolicy,
};
pub use store::{
    GraphSession, GraphStore, MemoryGraphStore, Neo4jConfig, Neo4jStore, SqliteGraphStore,
    StoreError, StoreId,
};
pub use tokio_util::sync::CancellationToken;

/// Parse a draw.io file without committing it (convenience wrapper).
pub fn parse_diagram(path: &std::path::Path) -> Result<Diagram, CircuitGraphError> {
    let body = std::fs::read_to_string(path).map_err(|source| CircuitGraphError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Diagram::parse(&body, ParserOptions::default())?)
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        CircuitGraph, CircuitGraphError, Config, IngestResult, IngestStats, Outcome,
        PipelineOptions, StoreConfig,
    };
}
