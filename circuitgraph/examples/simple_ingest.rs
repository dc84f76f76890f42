//! Simple ingest example: commit a draw.io schematic to an in-memory graph and print it.

use circuitgraph::prelude::*;
use circuitgraph::MemoryGraphStore;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), CircuitGraphError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tests/fixtures/rlc_circuit.drawio".to_string());
    let path = Path::new(&path);

    if !path.exists() {
        eprintln!("File not found: {}", path.display());
        eprintln!("Usage: cargo run --example simple_ingest [path/to/file.drawio]");
        std::process::exit(1);
    }

    let store = MemoryGraphStore::new();
    let service = CircuitGraph::new(Arc::new(store.clone()), PipelineOptions::default());
    let result = service.ingest_file(path).await?;

    println!("Diagram: {} ({})", result.report.diagram_name, result.report.diagram_id);
    println!("Committed components:  {}", result.stats.committed_components);
    println!("Committed connections: {}", result.stats.committed_connections);
    println!();

    if result.stats.has_failures() {
        println!("Failures:");
        for outcome in result.failures() {
            if let Some(error) = outcome.error() {
                println!("  - #{} ({}): {}", outcome.element.id, outcome.element.kind, error);
            }
        }
        println!();
    }

    let graph = store.snapshot()?;
    let stats = graph.stats();
    println!("Graph: {} vertices, {} edges", stats.vertex_count, stats.edge_count);
    for outcome in result.outcomes.iter().filter(|o| o.is_success() && !o.is_connection()) {
        let el = &outcome.element;
        let neighbors = graph.neighbors(&el.uuid, el.id);
        println!("  {} {} ({}) -> {:?}", el.id, el.value, el.sub_kind, neighbors);
    }

    Ok(())
}
