use criterion::{black_box, criterion_group, criterion_main, Criterion};
use circuitgraph::prelude::*;
use circuitgraph::{Diagram, MemoryGraphStore, ParserOptions};
use std::sync::Arc;

/// A ladder of `rungs` resistors joined by wires, wires listed first.
fn ladder(rungs: u32) -> String {
    let mut body = String::from(
        r#"<mxfile><diagram id="bench" name="Ladder"><mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/>"#,
    );
    for i in 1..rungs {
        body.push_str(&format!(
            r#"<mxCell id="{}" style="endArrow=none;exitX=1;exitY=0.5;entryX=0;entryY=0.5;" edge="1" parent="1" source="{}" target="{}"/>"#,
            100_000 + i,
            i,
            i + 1
        ));
    }
    for i in 1..=rungs {
        body.push_str(&format!(
            r#"<mxCell id="{i}" value="R{i}" style="shape=mxgraph.electrical.resistors.resistor_1;" vertex="1" parent="1"/>"#
        ));
    }
    body.push_str("</root></mxGraphModel></diagram></mxfile>");
    body
}

fn bench_parse_diagram(c: &mut Criterion) {
    let body = ladder(500);
    c.bench_function("parse_diagram_500", |b| {
        b.iter(|| Diagram::parse(black_box(&body), ParserOptions::default()));
    });
}

fn bench_ingest_memory(c: &mut Criterion) {
    let body = ladder(500);
    let runtime = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("ingest_memory_500", |b| {
        b.to_async(&runtime).iter(|| async {
            let service = CircuitGraph::new(
                Arc::new(MemoryGraphStore::new()),
                PipelineOptions::default(),
            );
            service.ingest_str(black_box(&body)).await
        });
    });
}

criterion_group!(benches, bench_parse_diagram, bench_ingest_memory);
criterion_main!(benches);
