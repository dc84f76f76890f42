//! Ingest Pipeline
//!
//! Moves the elements of one diagram from the parser into a graph store:
//!
//! ```text
//!                          ┌──────────────────┐
//!   parser ──► classify ─┬─► vertex committer ─┬─► outcomes
//!                        │ └──────────────────┘ │
//!                        │   holding queue      │
//!                        └─► (released after ───┘
//!                             vertex phase) ──► edge committer
//! ```
//!
//! No connection is committed before every component of the diagram has
//! had its commit attempt. Per-element failures are reported as
//! [`Outcome`]s and never stop the run. A broken document is rejected by
//! [`IngestPipeline::run`] before anything is committed; after that only a
//! worker panic or cancellation make [`IngestRun::finish`] return an error.

pub mod committer;
mod coordinator;
pub mod outcome;

use std::io::{Cursor, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::parser::{DiagramParser, ParseError, ParserOptions};
use crate::store::GraphStore;

pub use committer::{CommitterKind, CommitterStats};
use coordinator::Coordinator;
pub use outcome::Outcome;

const DEFAULT_COMPONENT_BUFFER: usize = 64;
const DEFAULT_CONNECTION_BUFFER: usize = 64;

/// What happens to elements whose category is not on the whitelist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Log and forget.
    #[default]
    Drop,
    /// Emit a failed [`Outcome`] carrying the classification error.
    Report,
}

/// Tuning for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Capacity of the vertex committer's inbox.
    pub component_buffer: usize,
    /// Capacity of the edge committer's inbox.
    pub connection_buffer: usize,
    pub unsupported: UnsupportedPolicy,
    /// See [`ParserOptions::tolerate_truncated_tail`].
    pub tolerate_truncated_tail: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            component_buffer: DEFAULT_COMPONENT_BUFFER,
            connection_buffer: DEFAULT_CONNECTION_BUFFER,
            unsupported: UnsupportedPolicy::Drop,
            tolerate_truncated_tail: true,
        }
    }
}

impl PipelineOptions {
    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            tolerate_truncated_tail: self.tolerate_truncated_tail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("{worker} committer failed: {message}")]
    WorkerFailed {
        worker: &'static str,
        message: String,
    },
    #[error("ingest cancelled")]
    Cancelled,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub diagram_id: String,
    pub diagram_name: String,
    pub store: String,
    pub started_at: DateTime<Utc>,
    /// Components forwarded to the vertex committer.
    pub components: usize,
    /// Connections released to the edge committer.
    pub connections: usize,
    /// Staged connections dropped because the run could not finish.
    pub connections_discarded: usize,
    /// Elements outside the category whitelist.
    pub rejected: usize,
    /// Structural cells without a style.
    pub skipped_cells: usize,
    pub vertex: CommitterStats,
    pub edge: CommitterStats,
    pub elapsed_ms: u64,
}

/// Runs diagrams into one store.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn GraphStore>,
    options: PipelineOptions,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn GraphStore>, options: PipelineOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Full parse pass over `body`, discarding elements as they come.
    fn check(&self, body: &[u8]) -> Result<usize, ParseError> {
        DiagramParser::new(body)
            .with_options(self.options.parser_options())
            .open()?
            .try_fold(0, |count, element| element.map(|_| count + 1))
    }

    /// Start ingesting the document read from `reader`.
    ///
    /// The document is read to the end and checked in full before any
    /// worker starts, so a malformed or identifier-less document fails here
    /// with nothing committed. Elements are then streamed one at a time from
    /// the buffered bytes. Reading happens on the calling thread; async
    /// callers holding a slow reader should read it on the blocking pool
    /// first (see [`crate::CircuitGraph::ingest_reader`]).
    /// Must be called from within a Tokio runtime.
    pub fn run<R>(&self, mut reader: R, cancel: CancellationToken) -> Result<IngestRun, PipelineError>
    where
        R: Read,
    {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).map_err(|e| {
            error!(error = %e, "document could not be read");
            PipelineError::Parse(ParseError::Read {
                message: e.to_string(),
            })
        })?;
        let elements = self.check(&body).map_err(|e| {
            error!(error = %e, "document rejected");
            PipelineError::Parse(e)
        })?;
        debug!(elements, bytes = body.len(), "document checked");

        let stream = DiagramParser::new(Cursor::new(body))
            .with_options(self.options.parser_options())
            .open()?;

        let run_id = Uuid::new_v4().to_string();
        let diagram_id = stream.uuid().to_string();
        let diagram_name = stream.name().to_string();
        let span = info_span!("ingest", run_id = %run_id, diagram = %diagram_id);
        span.in_scope(|| {
            info!(store = self.store.name(), name = %diagram_name, "ingest started");
        });

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            stream,
            store: self.store.clone(),
            options: self.options,
            outcomes: outcome_tx,
            cancel,
            report: RunReport {
                run_id,
                diagram_id: diagram_id.clone(),
                diagram_name: diagram_name.clone(),
                store: self.store.name().to_string(),
                started_at: Utc::now(),
                components: 0,
                connections: 0,
                connections_discarded: 0,
                rejected: 0,
                skipped_cells: 0,
                vertex: CommitterStats::default(),
                edge: CommitterStats::default(),
                elapsed_ms: 0,
            },
        };
        let handle = tokio::spawn(coordinator.drive().instrument(span));

        Ok(IngestRun {
            diagram_id,
            diagram_name,
            outcomes: outcome_rx,
            handle,
        })
    }
}

/// A run in progress.
///
/// Outcomes arrive in no particular order across the two committers. The
/// outcome stream ends once both committers have been joined.
pub struct IngestRun {
    diagram_id: String,
    diagram_name: String,
    outcomes: mpsc::UnboundedReceiver<Outcome>,
    handle: JoinHandle<Result<RunReport, PipelineError>>,
}

impl IngestRun {
    pub fn diagram_id(&self) -> &str {
        &self.diagram_id
    }

    pub fn diagram_name(&self) -> &str {
        &self.diagram_name
    }

    /// Next outcome, or `None` once the run is over.
    pub async fn next_outcome(&mut self) -> Option<Outcome> {
        self.outcomes.recv().await
    }

    /// Wait for the run to end. Outcomes not yet read are discarded.
    pub async fn finish(self) -> Result<RunReport, PipelineError> {
        drop(self.outcomes);
        join_coordinator(self.handle).await
    }

    /// Drain every outcome, then wait for the run to end.
    pub async fn collect(mut self) -> (Vec<Outcome>, Result<RunReport, PipelineError>) {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.outcomes.recv().await {
            outcomes.push(outcome);
        }
        (outcomes, join_coordinator(self.handle).await)
    }
}

async fn join_coordinator(
    handle: JoinHandle<Result<RunReport, PipelineError>>,
) -> Result<RunReport, PipelineError> {
    handle.await.unwrap_or_else(|e| {
        Err(PipelineError::WorkerFailed {
            worker: "coordinator",
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifyError;
    use crate::parser::schema::{Element, ElementError};
    use crate::store::{CommitOp, CommitStage, MemoryGraphStore, StoreError};
    use std::time::Duration;

    const RLC: &str = include_str!("../../tests/fixtures/rlc_circuit.drawio");
    const MIXED: &str = include_str!("../../tests/fixtures/mixed_shapes.drawio");
    const BROKEN: &str = include_str!("../../tests/fixtures/broken_cell_list.drawio");

    fn pipeline(store: &MemoryGraphStore, options: PipelineOptions) -> IngestPipeline {
        IngestPipeline::new(Arc::new(store.clone()), options)
    }

    async fn ingest(
        store: &MemoryGraphStore,
        options: PipelineOptions,
        doc: &'static str,
    ) -> (Vec<Outcome>, Result<RunReport, PipelineError>) {
        pipeline(store, options)
            .run(doc.as_bytes(), CancellationToken::new())
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_every_element_gets_one_outcome() {
        let store = MemoryGraphStore::new();
        let (outcomes, report) = ingest(&store, PipelineOptions::default(), RLC).await;
        let report = report.unwrap();

        assert_eq!(outcomes.len(), 7);
        assert_eq!(report.components, 3);
        assert_eq!(report.connections, 4);
        assert_eq!(report.skipped_cells, 2);
        assert_eq!(report.diagram_id, "uweCVhkyVy6MirBnUyNJ");
        assert_eq!(report.vertex.committed, 3);
        assert_eq!(report.edge.committed, 3);
        assert_eq!(report.edge.failed, 1);
        assert_eq!(report.components, report.vertex.received);
        assert_eq!(report.connections, report.edge.received);
    }

    #[tokio::test]
    async fn test_edges_start_after_last_vertex_ends() {
        let store = MemoryGraphStore::new().with_latency(Duration::from_millis(5));
        let options = PipelineOptions {
            component_buffer: 1,
            connection_buffer: 1,
            ..PipelineOptions::default()
        };
        let (_, report) = ingest(&store, options, RLC).await;
        report.unwrap();

        let calls = store.calls();
        let last_vertex_end = calls
            .iter()
            .rposition(|c| c.op == CommitOp::Vertex && c.stage == CommitStage::End)
            .unwrap();
        let first_edge_begin = calls
            .iter()
            .position(|c| c.op == CommitOp::Edge && c.stage == CommitStage::Begin)
            .unwrap();
        assert!(first_edge_begin > last_vertex_end);
    }

    #[tokio::test]
    async fn test_dangling_connection_is_reported() {
        let store = MemoryGraphStore::new();
        let (outcomes, _) = ingest(&store, PipelineOptions::default(), RLC).await;

        let dangling = outcomes.iter().find(|o| o.element.id == 9).unwrap();
        assert_eq!(
            dangling.error(),
            Some(&ElementError::Commit(StoreError::Dangling {
                id: 9,
                end: "target"
            }))
        );
    }

    #[tokio::test]
    async fn test_duplicate_wire_matches_existing_edge() {
        let store = MemoryGraphStore::new();
        let (outcomes, _) = ingest(&store, PipelineOptions::default(), RLC).await;

        let id_of = |eid: u32| outcomes.iter().find(|o| o.element.id == eid).unwrap().store_id;
        assert!(id_of(7).is_some());
        assert_eq!(id_of(7), id_of(10));
        assert_eq!(store.snapshot().unwrap().edge_count(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_dropped_by_default() {
        let store = MemoryGraphStore::new();
        let (outcomes, report) = ingest(&store, PipelineOptions::default(), MIXED).await;
        let report = report.unwrap();

        assert_eq!(report.rejected, 2);
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| !matches!(o.error(), Some(ElementError::Unsupported(_)))));

        // Wire 7 points at the rejected diode.
        let wire = outcomes.iter().find(|o| o.element.id == 7).unwrap();
        assert_eq!(
            wire.error(),
            Some(&ElementError::Commit(StoreError::NoMatch {
                uuid: "mixedShapes01".into(),
                local_id: 3
            }))
        );
    }

    #[tokio::test]
    async fn test_unsupported_reported_never_committed() {
        let store = MemoryGraphStore::new();
        let options = PipelineOptions {
            unsupported: UnsupportedPolicy::Report,
            ..PipelineOptions::default()
        };
        let (outcomes, _) = ingest(&store, options, MIXED).await;

        assert_eq!(outcomes.len(), 6);
        let diode = outcomes.iter().find(|o| o.element.id == 3).unwrap();
        assert_eq!(
            diode.error(),
            Some(&ElementError::Unsupported(ClassifyError::UnsupportedCategory {
                id: 3,
                kind: "diodes".into()
            }))
        );
        assert!(store.calls().iter().all(|c| c.local_id != 3 && c.local_id != 4));
    }

    #[tokio::test]
    async fn test_broken_cell_list_fails_before_any_commit() {
        let store = MemoryGraphStore::new();
        let result = pipeline(&store, PipelineOptions::default())
            .run(BROKEN.as_bytes(), CancellationToken::new());

        assert!(matches!(
            result,
            Err(PipelineError::Parse(ParseError::InvalidCellId { .. }))
        ));
        assert!(store.calls().is_empty());
        assert_eq!(store.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_malformed_markup_after_components_commits_nothing() {
        let store = MemoryGraphStore::new();
        let doc = r#"<mxfile><diagram id="d"><mxGraphModel><root>
<mxCell id="2" style="shape=mxgraph.electrical.resistors.resistor_1;" vertex="1"/>
<mxCell id="3" style="shape=mxgraph.electrical.capacitors.capacitor_1;" vertex="1"/>
<mxCell id="4" style="a=b"></root></mxGraphModel></diagram></mxfile>"#;
        let result = pipeline(&store, PipelineOptions::default()).run(doc.as_bytes(), CancellationToken::new());

        assert!(matches!(result, Err(PipelineError::Parse(ParseError::Xml { .. }))));
        assert!(store.calls().is_empty());
        assert_eq!(store.snapshot().unwrap().vertex_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_input_is_a_parse_failure() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
            }
        }

        let store = MemoryGraphStore::new();
        let result = pipeline(&store, PipelineOptions::default()).run(Failing, CancellationToken::new());
        assert!(matches!(result, Err(PipelineError::Parse(ParseError::Read { .. }))));
    }

    #[tokio::test]
    async fn test_missing_diagram_id_fails_synchronously() {
        let store = MemoryGraphStore::new();
        let doc = r#"<mxfile><diagram name="x"><mxGraphModel><root/></mxGraphModel></diagram></mxfile>"#;
        let result = pipeline(&store, PipelineOptions::default()).run(doc.as_bytes(), CancellationToken::new());

        assert!(matches!(result, Err(PipelineError::Parse(ParseError::MissingDiagramId))));
        assert_eq!(store.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let store = MemoryGraphStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (outcomes, report) = pipeline(&store, PipelineOptions::default())
            .run(RLC.as_bytes(), cancel)
            .unwrap()
            .collect()
            .await;

        assert_eq!(report, Err(PipelineError::Cancelled));
        assert!(outcomes.is_empty());
        assert!(store.calls().is_empty());
        assert_eq!(store.sessions_opened(), store.sessions_released());
    }

    #[tokio::test]
    async fn test_worker_panic_releases_session() {
        let store = MemoryGraphStore::new().with_failures(Arc::new(|el: &Element| -> Option<StoreError> {
            if el.id == 4 {
                panic!("store exploded");
            }
            None
        }));
        let (_, report) = ingest(&store, PipelineOptions::default(), RLC).await;

        match report {
            Err(PipelineError::WorkerFailed { worker, message }) => {
                assert_eq!(worker, "vertex");
                assert!(message.contains("store exploded"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(store.calls().iter().all(|c| c.op == CommitOp::Vertex));
        assert_eq!(store.sessions_opened(), 2);
        assert_eq!(store.sessions_released(), 2);
    }

    #[tokio::test]
    async fn test_finish_without_reading_outcomes() {
        let store = MemoryGraphStore::new();
        let run = pipeline(&store, PipelineOptions::default())
            .run(RLC.as_bytes(), CancellationToken::new())
            .unwrap();
        assert_eq!(run.diagram_id(), "uweCVhkyVy6MirBnUyNJ");

        let report = run.finish().await.unwrap();
        assert_eq!(report.vertex.committed, 3);
        assert_eq!(store.snapshot().unwrap().vertex_count(), 3);
    }
}
