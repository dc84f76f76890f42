//! In-memory graph store
//!
//! A petgraph-backed store used for tests, dry runs and small diagrams.
//! Vertices are keyed by (diagram uuid, local id) and edges by
//! (diagram uuid, source local id, target local id), mirroring the merge
//! semantics of the database backends. Every commit is recorded in an
//! ordered call log so callers can check the order in which the pipeline
//! issued its commits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{edge_endpoints, GraphSession, GraphStore, StoreError, StoreId};
use crate::parser::schema::{Element, Terminal};

/// A committed component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexRecord {
    pub uuid: String,
    pub local_id: u32,
    pub value: String,
    pub kind: String,
    pub sub_kind: String,
}

/// A committed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub local_id: u32,
    pub exit: Terminal,
    pub entry: Terminal,
}

/// Statistics about the stored graph
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub vertex_count: usize,
    pub edge_count: usize,
    pub diagram_count: usize,
}

/// Component/connection graph with keyed lookup.
#[derive(Debug, Clone, Default)]
pub struct CircuitTopology {
    graph: DiGraph<VertexRecord, EdgeRecord>,
    vertex_indices: HashMap<(String, u32), NodeIndex>,
    edge_indices: HashMap<(String, u32, u32), EdgeIndex>,
}

impl CircuitTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the component unless it exists; returns its index either way.
    pub fn merge_vertex(&mut self, element: &Element) -> NodeIndex {
        let key = (element.uuid.clone(), element.id);
        if let Some(&idx) = self.vertex_indices.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(VertexRecord {
            uuid: element.uuid.clone(),
            local_id: element.id,
            value: element.value.clone(),
            kind: element.kind.clone(),
            sub_kind: element.sub_kind.clone(),
        });
        self.vertex_indices.insert(key, idx);
        idx
    }

    /// Connect two existing components unless already connected.
    pub fn merge_edge(&mut self, element: &Element) -> Result<EdgeIndex, StoreError> {
        let (source, target) = edge_endpoints(element)?;
        let key = (element.uuid.clone(), source, target);
        if let Some(&idx) = self.edge_indices.get(&key) {
            return Ok(idx);
        }

        let from = self.vertex_index(&element.uuid, source)?;
        let to = self.vertex_index(&element.uuid, target)?;
        let link = element.link.clone().unwrap_or_default();
        let idx = self.graph.add_edge(
            from,
            to,
            EdgeRecord {
                local_id: element.id,
                exit: link.exit,
                entry: link.entry,
            },
        );
        self.edge_indices.insert(key, idx);
        Ok(idx)
    }

    fn vertex_index(&self, uuid: &str, local_id: u32) -> Result<NodeIndex, StoreError> {
        self.vertex_indices
            .get(&(uuid.to_string(), local_id))
            .copied()
            .ok_or_else(|| StoreError::NoMatch {
                uuid: uuid.to_string(),
                local_id,
            })
    }

    /// Get a component by its diagram key
    pub fn vertex(&self, uuid: &str, local_id: u32) -> Option<&VertexRecord> {
        self.vertex_indices
            .get(&(uuid.to_string(), local_id))
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Local ids of every component wired to `local_id`, in either direction.
    pub fn neighbors(&self, uuid: &str, local_id: u32) -> Vec<u32> {
        let Ok(idx) = self.vertex_index(uuid, local_id) else {
            return Vec::new();
        };

        let mut ids: Vec<u32> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.target())
            .chain(
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .map(|e| e.source()),
            )
            .filter_map(|n| self.graph.node_weight(n))
            .map(|v| v.local_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Shortest wire path between two components of a diagram, ignoring direction.
    pub fn find_path(&self, uuid: &str, from: u32, to: u32) -> Option<Vec<u32>> {
        let from_idx = self.vertex_index(uuid, from).ok()?;
        let to_idx = self.vertex_index(uuid, to).ok()?;

        // Breadth-first over undirected neighbours; wires carry no direction electrically.
        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([from_idx]);
        previous.insert(from_idx, from_idx);

        while let Some(idx) = queue.pop_front() {
            if idx == to_idx {
                let mut path = vec![idx];
                let mut cursor = idx;
                while cursor != from_idx {
                    cursor = previous[&cursor];
                    path.push(cursor);
                }
                path.reverse();
                return Some(
                    path.into_iter()
                        .filter_map(|n| self.graph.node_weight(n))
                        .map(|v| v.local_id)
                        .collect(),
                );
            }
            for next in self.graph.neighbors_undirected(idx) {
                if !previous.contains_key(&next) {
                    previous.insert(next, idx);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    pub fn stats(&self) -> GraphStats {
        let mut diagrams: Vec<&str> = self
            .graph
            .node_weights()
            .map(|v| v.uuid.as_str())
            .collect();
        diagrams.sort_unstable();
        diagrams.dedup();

        GraphStats {
            vertex_count: self.vertex_count(),
            edge_count: self.edge_count(),
            diagram_count: diagrams.len(),
        }
    }
}

/// Which logical operation a call-log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitOp {
    Vertex,
    Edge,
}

/// Whether a call-log entry marks the start or the end of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitStage {
    Begin,
    End,
}

/// One entry of the ordered call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitCall {
    pub op: CommitOp,
    pub stage: CommitStage,
    pub uuid: String,
    pub local_id: u32,
}

/// Decides per element whether a commit should fail.
pub type FailureInjector = Arc<dyn Fn(&Element) -> Option<StoreError> + Send + Sync>;

struct Shared {
    graph: Mutex<CircuitTopology>,
    calls: Mutex<Vec<CommitCall>>,
    sessions_opened: AtomicUsize,
    sessions_released: AtomicUsize,
    latency: Option<Duration>,
    failures: Option<FailureInjector>,
}

/// Shared, cloneable in-memory store. Clones see the same graph.
#[derive(Clone)]
pub struct MemoryGraphStore {
    shared: Arc<Shared>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Delay every commit, to widen scheduling windows in tests.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self::build(Some(latency), self.shared.failures.clone())
    }

    /// Fail commits for which `injector` returns an error.
    pub fn with_failures(self, injector: FailureInjector) -> Self {
        Self::build(self.shared.latency, Some(injector))
    }

    fn build(latency: Option<Duration>, failures: Option<FailureInjector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(CircuitTopology::new()),
                calls: Mutex::new(Vec::new()),
                sessions_opened: AtomicUsize::new(0),
                sessions_released: AtomicUsize::new(0),
                latency,
                failures,
            }),
        }
    }

    /// Snapshot of the stored graph.
    pub fn snapshot(&self) -> Result<CircuitTopology, StoreError> {
        Ok(lock(&self.shared.graph)?.clone())
    }

    /// Ordered log of every commit begin/end.
    pub fn calls(&self) -> Vec<CommitCall> {
        lock(&self.shared.calls).map(|c| c.clone()).unwrap_or_default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_released(&self) -> usize {
        self.shared.sessions_released.load(Ordering::SeqCst)
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open_session(&self) -> Result<Box<dyn GraphSession>, StoreError> {
        self.shared.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            released: false,
        }))
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    released: bool,
}

impl MemorySession {
    fn record(&self, op: CommitOp, stage: CommitStage, element: &Element) -> Result<(), StoreError> {
        lock(&self.shared.calls)?.push(CommitCall {
            op,
            stage,
            uuid: element.uuid.clone(),
            local_id: element.id,
        });
        Ok(())
    }

    async fn commit<F>(&self, op: CommitOp, element: &Element, apply: F) -> Result<StoreId, StoreError>
    where
        F: FnOnce(&mut CircuitTopology) -> Result<usize, StoreError>,
    {
        self.record(op, CommitStage::Begin, element)?;
        if let Some(latency) = self.shared.latency {
            tokio::time::sleep(latency).await;
        }

        let result = match self.shared.failures.as_ref().and_then(|f| f(element)) {
            Some(error) => Err(error),
            None => {
                let mut graph = lock(&self.shared.graph)?;
                apply(&mut graph).map(|idx| idx as StoreId)
            }
        };

        self.record(op, CommitStage::End, element)?;
        debug!(op = ?op, uuid = %element.uuid, id = element.id, ok = result.is_ok(), "memory commit");
        result
    }
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn merge_vertex(&mut self, element: &Element) -> Result<StoreId, StoreError> {
        self.commit(CommitOp::Vertex, element, |g| Ok(g.merge_vertex(element).index()))
            .await
    }

    async fn merge_edge(&mut self, element: &Element) -> Result<StoreId, StoreError> {
        self.commit(CommitOp::Edge, element, |g| g.merge_edge(element).map(|e| e.index()))
            .await
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.sessions_released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::schema::Link;

    fn resistor(id: u32) -> Element {
        Element::component("d1", id, "resistors", "resistor_1", "")
    }

    fn wire(id: u32, source: u32, target: u32) -> Element {
        Element::connection(
            "d1",
            id,
            "",
            Link {
                source_id: Some(source),
                target_id: Some(target),
                ..Link::default()
            },
        )
    }

    #[test]
    fn test_merge_vertex_is_idempotent() {
        let mut graph = CircuitTopology::new();
        let a = graph.merge_vertex(&resistor(3));
        let b = graph.merge_vertex(&resistor(3));
        assert_eq!(a, b);
        assert_eq!(graph.vertex_count(), 1);
    }

    #[test]
    fn test_same_local_id_in_other_diagram_is_distinct() {
        let mut graph = CircuitTopology::new();
        graph.merge_vertex(&resistor(3));
        graph.merge_vertex(&Element::component("d2", 3, "resistors", "r", ""));
        assert_eq!(graph.stats().vertex_count, 2);
        assert_eq!(graph.stats().diagram_count, 2);
    }

    #[test]
    fn test_edge_requires_endpoints() {
        let mut graph = CircuitTopology::new();
        graph.merge_vertex(&resistor(3));
        assert_eq!(
            graph.merge_edge(&wire(7, 3, 6)),
            Err(StoreError::NoMatch {
                uuid: "d1".into(),
                local_id: 6
            })
        );

        graph.merge_vertex(&resistor(6));
        let first = graph.merge_edge(&wire(7, 3, 6)).unwrap();
        let again = graph.merge_edge(&wire(7, 3, 6)).unwrap();
        assert_eq!(first, again);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_dangling_wire() {
        let mut graph = CircuitTopology::new();
        let el = Element::connection(
            "d1",
            9,
            "",
            Link {
                source_id: Some(4),
                ..Link::default()
            },
        );
        assert_eq!(
            graph.merge_edge(&el),
            Err(StoreError::Dangling { id: 9, end: "target" })
        );
    }

    #[test]
    fn test_neighbors_and_path() {
        let mut graph = CircuitTopology::new();
        for id in [1, 2, 3, 4] {
            graph.merge_vertex(&resistor(id));
        }
        graph.merge_edge(&wire(10, 1, 2)).unwrap();
        graph.merge_edge(&wire(11, 3, 2)).unwrap();

        assert_eq!(graph.neighbors("d1", 2), vec![1, 3]);
        assert_eq!(graph.find_path("d1", 1, 3), Some(vec![1, 2, 3]));
        assert_eq!(graph.find_path("d1", 1, 4), None);
    }

    #[tokio::test]
    async fn test_session_logs_and_release() {
        let store = MemoryGraphStore::new();
        let mut session = store.open_session().await.unwrap();
        let a = session.merge_vertex(&resistor(1)).await.unwrap();
        let b = session.merge_vertex(&resistor(1)).await.unwrap();
        assert_eq!(a, b);
        session.release();
        session.release();

        assert_eq!(store.sessions_opened(), 1);
        assert_eq!(store.sessions_released(), 1);
        let calls = store.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].stage, CommitStage::Begin);
        assert_eq!(calls[1].stage, CommitStage::End);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryGraphStore::new().with_failures(Arc::new(|el: &Element| {
            (el.id == 2).then(|| StoreError::Backend("boom".into()))
        }));
        let mut session = store.open_session().await.unwrap();
        assert!(session.merge_vertex(&resistor(1)).await.is_ok());
        assert_eq!(
            session.merge_vertex(&resistor(2)).await,
            Err(StoreError::Backend("boom".into()))
        );
        assert_eq!(store.snapshot().unwrap().vertex_count(), 1);
    }
}
