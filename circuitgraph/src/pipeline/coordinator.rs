//! Phase-ordered dispatch of one diagram's elements.
//!
//! Components are forwarded to the vertex committer as they are parsed;
//! connections wait in a FIFO holding queue. Once the stream is exhausted
//! the component channel is closed and the vertex committer joined, and only
//! then is the holding queue released to the edge committer. That join is
//! what guarantees every endpoint has had its commit attempt before any edge
//! referring to it is tried.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::committer::{run_committer, CommitterKind, CommitterStats};
use super::outcome::Outcome;
use super::{PipelineError, PipelineOptions, RunReport, UnsupportedPolicy};
use crate::classifier::Classifier;
use crate::parser::schema::Element;
use crate::parser::ElementStream;
use crate::store::GraphStore;

pub(crate) struct Coordinator<R: BufRead> {
    pub(crate) stream: ElementStream<R>,
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) options: PipelineOptions,
    pub(crate) outcomes: mpsc::UnboundedSender<Outcome>,
    pub(crate) cancel: CancellationToken,
    pub(crate) report: RunReport,
}

impl<R: BufRead + Send + 'static> Coordinator<R> {
    pub(crate) async fn drive(self) -> Result<RunReport, PipelineError> {
        let Coordinator {
            mut stream,
            store,
            options,
            outcomes,
            cancel,
            mut report,
        } = self;
        let started = Instant::now();
        let classifier = Classifier::new();

        let (component_tx, component_rx) = mpsc::channel(options.component_buffer.max(1));
        let (connection_tx, connection_rx) = mpsc::channel(options.connection_buffer.max(1));

        let vertex = tokio::spawn(
            run_committer(
                CommitterKind::Vertex,
                store.clone(),
                component_rx,
                outcomes.clone(),
                cancel.clone(),
            )
            .instrument(Span::current()),
        );
        let edge = tokio::spawn(
            run_committer(
                CommitterKind::Edge,
                store.clone(),
                connection_rx,
                outcomes.clone(),
                cancel.clone(),
            )
            .instrument(Span::current()),
        );

        let mut staged: VecDeque<Element> = VecDeque::new();
        let mut failure: Option<PipelineError> = None;

        // Component phase
        loop {
            if cancel.is_cancelled() {
                failure = Some(PipelineError::Cancelled);
                break;
            }
            let element = match stream.next() {
                Some(Ok(element)) => element,
                // The bytes were checked before the run started.
                Some(Err(e)) => {
                    error!(error = %e, "parse failed mid-stream; discarding staged connections");
                    failure = Some(PipelineError::Parse(e));
                    break;
                }
                None => break,
            };

            match classifier.category(&element) {
                Ok(category) if category.is_component() => {
                    debug!(id = element.id, kind = %category, "routing component");
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            failure = Some(PipelineError::Cancelled);
                            break;
                        }
                        sent = component_tx.send(element) => sent,
                    };
                    if sent.is_err() {
                        failure = Some(PipelineError::WorkerFailed {
                            worker: CommitterKind::Vertex.as_str(),
                            message: "component channel closed early".to_string(),
                        });
                        break;
                    }
                    report.components += 1;
                }
                Ok(_) => {
                    debug!(id = element.id, queued = staged.len() + 1, "staging connection");
                    staged.push_back(element);
                }
                Err(e) => {
                    report.rejected += 1;
                    match options.unsupported {
                        UnsupportedPolicy::Drop => {
                            warn!(id = element.id, kind = %element.kind, "dropping unsupported element");
                        }
                        UnsupportedPolicy::Report => {
                            warn!(id = element.id, kind = %element.kind, "reporting unsupported element");
                            let _ = outcomes.send(Outcome::failed(element, e));
                        }
                    }
                }
            }
        }
        report.skipped_cells = stream.skipped();
        drop(stream);

        // Phase transition: every component has had its commit attempt once
        // the vertex committer has returned.
        drop(component_tx);
        let vertex_stats = joined(CommitterKind::Vertex, vertex.await);
        if let Err(e) = &vertex_stats {
            error!(error = %e, "vertex committer failed");
        }

        // Connection phase
        if failure.is_none() && vertex_stats.is_ok() {
            info!(connections = staged.len(), "releasing staged connections");
            while let Some(element) = staged.pop_front() {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        failure = Some(PipelineError::Cancelled);
                        break;
                    }
                    sent = connection_tx.send(element) => sent,
                };
                if sent.is_err() {
                    failure = Some(PipelineError::WorkerFailed {
                        worker: CommitterKind::Edge.as_str(),
                        message: "connection channel closed early".to_string(),
                    });
                    break;
                }
                report.connections += 1;
            }
        }
        if !staged.is_empty() {
            warn!(discarded = staged.len(), "staged connections discarded");
            report.connections_discarded = staged.len();
            staged.clear();
        }

        drop(connection_tx);
        let edge_stats = joined(CommitterKind::Edge, edge.await);
        if let Err(e) = &edge_stats {
            error!(error = %e, "edge committer failed");
        }
        drop(outcomes);

        let vertex_stats = vertex_stats?;
        let edge_stats = edge_stats?;
        if let Some(failure) = failure {
            return Err(failure);
        }

        report.vertex = vertex_stats;
        report.edge = edge_stats;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            components = report.components,
            connections = report.connections,
            rejected = report.rejected,
            failed = report.vertex.failed + report.edge.failed,
            elapsed_ms = report.elapsed_ms,
            "ingest finished"
        );
        Ok(report)
    }
}

fn joined(
    kind: CommitterKind,
    result: Result<CommitterStats, JoinError>,
) -> Result<CommitterStats, PipelineError> {
    result.map_err(|e| PipelineError::WorkerFailed {
        worker: kind.as_str(),
        message: join_message(e),
    })
}

fn join_message(error: JoinError) -> String {
    if error.is_panic() {
        let panic = error.into_panic();
        if let Some(message) = panic.downcast_ref::<&str>() {
            return format!("panicked: {message}");
        }
        if let Some(message) = panic.downcast_ref::<String>() {
            return format!("panicked: {message}");
        }
        return "panicked".to_string();
    }
    error.to_string()
}
