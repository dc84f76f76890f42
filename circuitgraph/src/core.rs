//! Ingest service shared by the CLI and library users.
//! Holds no global state: build a [`CircuitGraph`] and pass it around.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::classifier::{Category, Classifier};
use crate::config::{Config, ConfigError};
use crate::parser::schema::{Diagram, ElementError};
use crate::parser::ParseError;
use crate::pipeline::{IngestPipeline, Outcome, PipelineError, PipelineOptions, RunReport};
use crate::store::{GraphStore, StoreError};

const DIAGRAM_EXTENSIONS: [&str; 2] = ["drawio", "xml"];

#[derive(Debug, thiserror::Error)]
pub enum CircuitGraphError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read document: {0}")]
    Read(#[source] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts over one ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub committed_components: usize,
    pub committed_connections: usize,
    /// Outcomes carrying a commit error.
    pub failed: usize,
    /// Elements outside the category whitelist.
    pub rejected: usize,
}

impl IngestStats {
    fn from_run(outcomes: &[Outcome], report: &RunReport) -> Self {
        let mut stats = IngestStats {
            rejected: report.rejected,
            ..IngestStats::default()
        };
        for outcome in outcomes {
            match outcome.error() {
                None if outcome.is_connection() => stats.committed_connections += 1,
                None => stats.committed_components += 1,
                Some(ElementError::Commit(_)) => stats.failed += 1,
                Some(ElementError::Unsupported(_)) => {}
            }
        }
        stats
    }

    pub fn committed(&self) -> usize {
        self.committed_components + self.committed_connections
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Result of ingesting one diagram.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub file: Option<PathBuf>,
    pub report: RunReport,
    pub stats: IngestStats,
    pub outcomes: Vec<Outcome>,
}

impl IngestResult {
    /// Outcomes that did not make it into the store.
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

/// How one element of an inspected diagram would be routed.
#[derive(Debug, Clone, Serialize)]
pub struct ElementClass {
    pub id: u32,
    pub kind: String,
    pub sub_kind: String,
    pub value: String,
    pub category: Option<Category>,
    pub source_id: Option<u32>,
    pub target_id: Option<u32>,
}

impl ElementClass {
    pub fn route(&self) -> &'static str {
        match self.category {
            Some(c) if c.is_component() => "vertex",
            Some(_) => "edge",
            None => "unsupported",
        }
    }
}

/// A parsed diagram with its classification, nothing committed.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub diagram: Diagram,
    pub elements: Vec<ElementClass>,
}

impl Inspection {
    pub fn supported(&self) -> usize {
        self.elements.iter().filter(|e| e.category.is_some()).count()
    }
}

/// Ingest service over one graph store.
#[derive(Clone)]
pub struct CircuitGraph {
    pipeline: IngestPipeline,
}

impl CircuitGraph {
    pub fn new(store: Arc<dyn GraphStore>, options: PipelineOptions) -> Self {
        Self {
            pipeline: IngestPipeline::new(store, options),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, CircuitGraphError> {
        Ok(Self::new(config.build_store()?, config.pipeline))
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        self.pipeline.store()
    }

    pub fn options(&self) -> &PipelineOptions {
        self.pipeline.options()
    }

    /// Ingest one document and wait for every outcome.
    ///
    /// The reader is drained on the blocking pool before the run starts.
    pub async fn ingest_reader<R>(&self, reader: R) -> Result<IngestResult, CircuitGraphError>
    where
        R: Read + Send + 'static,
    {
        self.ingest_reader_with_cancel(reader, CancellationToken::new())
            .await
    }

    pub async fn ingest_reader_with_cancel<R>(
        &self,
        mut reader: R,
        cancel: CancellationToken,
    ) -> Result<IngestResult, CircuitGraphError>
    where
        R: Read + Send + 'static,
    {
        let body = tokio::task::spawn_blocking(move || {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).map(|_| body)
        })
        .await
        .map_err(|e| CircuitGraphError::Read(std::io::Error::other(e)))?
        .map_err(CircuitGraphError::Read)?;
        self.ingest_bytes(body, cancel).await
    }

    pub async fn ingest_str(&self, body: &str) -> Result<IngestResult, CircuitGraphError> {
        self.ingest_bytes(body.as_bytes().to_vec(), CancellationToken::new())
            .await
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<IngestResult, CircuitGraphError> {
        info!(file = %path.display(), "ingesting file");
        let body = tokio::fs::read(path)
            .await
            .map_err(|source| CircuitGraphError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut result = self.ingest_bytes(body, CancellationToken::new()).await?;
        result.file = Some(path.to_path_buf());
        Ok(result)
    }

    async fn ingest_bytes(
        &self,
        body: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<IngestResult, CircuitGraphError> {
        let run = self.pipeline.run(Cursor::new(body), cancel)?;
        let (outcomes, report) = run.collect().await;
        let report = report?;
        let stats = IngestStats::from_run(&outcomes, &report);
        Ok(IngestResult {
            file: None,
            report,
            stats,
            outcomes,
        })
    }

    /// Parse and classify without committing anything.
    pub fn inspect_str(&self, body: &str) -> Result<Inspection, CircuitGraphError> {
        let diagram = Diagram::parse(body, self.options().parser_options())?;
        let classifier = Classifier::new();
        let elements = diagram
            .elements
            .iter()
            .map(|el| ElementClass {
                id: el.id,
                kind: el.kind.clone(),
                sub_kind: el.sub_kind.clone(),
                value: el.value.clone(),
                category: classifier.category(el).ok(),
                source_id: el.source_id(),
                target_id: el.target_id(),
            })
            .collect();
        Ok(Inspection { diagram, elements })
    }

    pub fn inspect_file(&self, path: &Path) -> Result<Inspection, CircuitGraphError> {
        let body = std::fs::read_to_string(path).map_err(|source| CircuitGraphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.inspect_str(&body)
    }
}

/// Recursively discover draw.io documents in a directory.
pub fn discover_diagrams(dir: &Path) -> Result<Vec<PathBuf>, CircuitGraphError> {
    let mut files = Vec::new();
    walk_dir(dir, &mut files, 0)?;
    files.sort();
    Ok(files)
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>, depth: usize) -> Result<(), CircuitGraphError> {
    if depth > 20 {
        return Ok(());
    }
    let io = |source| CircuitGraphError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.is_dir() {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with('.') || name == "node_modules" || name == "target" {
                continue;
            }
            walk_dir(&path, files, depth + 1)?;
        } else if path.is_file() {
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
            if DIAGRAM_EXTENSIONS.contains(&ext) {
                files.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;

    const RLC: &str = include_str!("../tests/fixtures/rlc_circuit.drawio");

    fn service() -> (MemoryGraphStore, CircuitGraph) {
        let store = MemoryGraphStore::new();
        let service = CircuitGraph::new(Arc::new(store.clone()), PipelineOptions::default());
        (store, service)
    }

    #[tokio::test]
    async fn test_ingest_str_stats() {
        let (_, service) = service();
        let result = service.ingest_str(RLC).await.unwrap();

        assert_eq!(
            result.stats,
            IngestStats {
                committed_components: 3,
                committed_connections: 3,
                failed: 1,
                rejected: 0,
            }
        );
        assert_eq!(result.failures().count(), 1);
        assert!(result.file.is_none());
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (store, service) = service();
        service.ingest_str(RLC).await.unwrap();
        service.ingest_str(RLC).await.unwrap();

        let graph = store.snapshot().unwrap();
        assert_eq!(graph.vertex_count(), 3);
        assert_eq!(graph.edge_count(), 2);
    }

    #[tokio::test]
    async fn test_ingest_file_reports_missing_path() {
        let (store, service) = service();
        let missing = Path::new("no/such/diagram.drawio");

        match service.ingest_file(missing).await {
            Err(CircuitGraphError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_ingest_reader_drains_on_blocking_pool() {
        let (_, service) = service();
        let file = std::fs::File::open(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/rlc_circuit.drawio"
        ))
        .unwrap();

        let result = service
            .ingest_reader(std::io::BufReader::new(file))
            .await
            .unwrap();
        assert_eq!(result.stats.committed(), 6);
    }

    #[test]
    fn test_inspect_routes_elements() {
        let (store, service) = service();
        let inspection = service.inspect_str(RLC).unwrap();

        assert_eq!(inspection.diagram.uuid, "uweCVhkyVy6MirBnUyNJ");
        assert_eq!(inspection.elements.len(), 7);
        assert_eq!(inspection.supported(), 7);
        let r1 = inspection.elements.iter().find(|e| e.id == 3).unwrap();
        assert_eq!(r1.route(), "vertex");
        let wire = inspection.elements.iter().find(|e| e.id == 9).unwrap();
        assert_eq!(wire.route(), "edge");
        assert_eq!(wire.target_id, None);
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_discover_diagrams() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.drawio"), RLC).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.xml"), RLC).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join(".cache/c.drawio"), RLC).unwrap();

        let found = discover_diagrams(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| !p.to_string_lossy().contains(".cache")));
    }
}
