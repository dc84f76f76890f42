//! Vertex and edge committers
//!
//! A committer is one tokio task that drains its inbox, issues one upsert
//! per element through a session it owns, and forwards the result to the
//! shared outcome channel. The session is released on every exit path,
//! including unwinding out of a panicking store call.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::outcome::Outcome;
use crate::parser::schema::Element;
use crate::store::{GraphStore, StoreError};

/// Which half of the graph a committer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitterKind {
    Vertex,
    Edge,
}

impl CommitterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitterKind::Vertex => "vertex",
            CommitterKind::Edge => "edge",
        }
    }
}

/// What a committer did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitterStats {
    pub received: usize,
    pub committed: usize,
    pub failed: usize,
}

pub(crate) async fn run_committer(
    kind: CommitterKind,
    store: Arc<dyn GraphStore>,
    mut inbox: mpsc::Receiver<Element>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    cancel: CancellationToken,
) -> CommitterStats {
    let mut stats = CommitterStats::default();

    let mut open_error = None;
    let mut session = match store.open_session().await {
        Ok(session) => {
            info!(committer = kind.as_str(), store = store.name(), "session opened");
            Some(scopeguard::guard(session, move |mut session| {
                session.release();
                info!(committer = kind.as_str(), "session released");
            }))
        }
        Err(error) => {
            warn!(committer = kind.as_str(), error = %error, "could not open session");
            open_error = Some(error);
            None
        }
    };

    loop {
        let element = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(element) => element,
                None => break,
            },
        };
        stats.received += 1;

        let result = if cancel.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            match session.as_mut() {
                Some(session) => match kind {
                    CommitterKind::Vertex => session.merge_vertex(&element).await,
                    CommitterKind::Edge => session.merge_edge(&element).await,
                },
                None => Err(open_error
                    .clone()
                    .unwrap_or_else(|| StoreError::Unavailable("no session".to_string()))),
            }
        };

        let outcome = match result {
            Ok(store_id) => {
                stats.committed += 1;
                debug!(committer = kind.as_str(), id = element.id, store_id, "committed");
                Outcome::committed(element, store_id)
            }
            Err(error) => {
                stats.failed += 1;
                warn!(committer = kind.as_str(), id = element.id, error = %error, "commit failed");
                Outcome::failed(element, error)
            }
        };

        // A consumer that stopped listening does not stop the commits.
        let _ = outcomes.send(outcome);
    }

    debug!(
        committer = kind.as_str(),
        received = stats.received,
        committed = stats.committed,
        failed = stats.failed,
        "committer finished"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;

    #[tokio::test]
    async fn test_committer_releases_session_on_close() {
        let store = MemoryGraphStore::new();
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        tx.send(Element::component("d", 1, "resistors", "r", "")).await.unwrap();
        drop(tx);

        let stats = run_committer(
            CommitterKind::Vertex,
            Arc::new(store.clone()),
            rx,
            out_tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(stats.committed, 1);
        assert!(out_rx.recv().await.unwrap().is_success());
        assert_eq!(store.sessions_opened(), 1);
        assert_eq!(store.sessions_released(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_committer_stops_receiving() {
        let store = MemoryGraphStore::new();
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        tx.send(Element::component("d", 1, "resistors", "r", "")).await.unwrap();

        let stats = run_committer(CommitterKind::Vertex, Arc::new(store.clone()), rx, out_tx, cancel).await;

        assert_eq!(stats.received, 0);
        assert!(out_rx.recv().await.is_none());
        assert!(store.calls().is_empty());
        assert_eq!(store.sessions_released(), 1);
    }
}
