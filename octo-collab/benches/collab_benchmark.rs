use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use octo_collab::broadcast::BroadcastGroup;
use octo_collab::codec::{GraphCodec, GraphDocument, GraphEdge, GraphNode, GraphPayload, LogCodec, LogPayload, NodeType};
use octo_collab::protocol::{self, Frame, SyncMessage};
use octo_collab::storage::{DurableRecord, MemoryCache, MemoryRepository, Repositories};
use octo_collab::{Binders, CacheConfig, DocumentIdentity, RegistryConfig, SessionRegistry};
use uuid::Uuid;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Text, Transact};

fn graph_of(nodes: usize) -> GraphDocument {
    let mut graph = GraphDocument::with_head(GraphNode::new("H", NodeType::Head, "bench"));
    for i in 0..nodes {
        let id = format!("N{i}");
        graph.insert_node(GraphNode::new(&id, NodeType::Note, format!("note {i}")).at(i as f64, 0.5));
        graph.insert_edge(format!("E{i}"), GraphEdge::new("H", id));
    }
    graph
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = Frame::Sync(SyncMessage::Update(vec![0u8; 64]));

    c.bench_function("frame_encode_update_64B", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode_v1());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = protocol::update(vec![0u8; 64]);

    c.bench_function("frame_decode_update_64B", |b| {
        b.iter(|| {
            black_box(protocol::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_graph_encode_100(c: &mut Criterion) {
    let graph = graph_of(100);

    c.bench_function("graph_encode_100_nodes", |b| {
        b.iter(|| {
            black_box(GraphCodec::encode(black_box(&graph)).unwrap());
        })
    });
}

fn bench_graph_decode_100(c: &mut Criterion) {
    let payload = GraphCodec::encode(&graph_of(100)).unwrap();

    c.bench_function("graph_decode_100_nodes", |b| {
        b.iter(|| {
            black_box(GraphCodec::decode(black_box(&payload)).unwrap());
        })
    });
}

fn bench_graph_extract_100(c: &mut Criterion) {
    let doc = Doc::new();
    GraphCodec::apply(&doc, &graph_of(100)).unwrap();

    c.bench_function("graph_extract_100_nodes", |b| {
        b.iter(|| {
            black_box(GraphCodec::extract(black_box(&doc)).unwrap());
        })
    });
}

fn bench_log_snapshot_10kb(c: &mut Criterion) {
    let doc = Doc::new();
    let content = doc.get_or_insert_text("content");
    {
        let mut txn = doc.transact_mut();
        content.insert(&mut txn, 0, &"lorem ipsum ".repeat(850));
    }

    c.bench_function("log_snapshot_encode_10KB", |b| {
        b.iter(|| {
            black_box(LogCodec::encode(&LogCodec::snapshot(black_box(&doc))));
        })
    });
}

fn bench_broadcast_100_sessions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.join(Uuid::new_v4()).await);
                }
                black_box(group.publish(Uuid::new_v4(), vec![0u8; 64]));
            });
        })
    });
}

fn bench_attach_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let notes = Arc::new(MemoryRepository::<LogPayload>::new());
    let registry = rt.block_on(async {
        notes.insert(DurableRecord::new("T1", "bench", None)).await;
        let repositories = Repositories::new(Arc::new(MemoryRepository::<GraphPayload>::new()), notes.clone());
        let binders = Binders::tiered(Arc::new(MemoryCache::new()), &repositories, &CacheConfig::default());
        SessionRegistry::new(binders, RegistryConfig::default())
    });
    let identity = DocumentIdentity::log("T1");

    c.bench_function("registry_attach_release_cold", |b| {
        b.iter(|| {
            rt.block_on(async {
                let guard = registry.get_or_create(&identity).await.unwrap();
                guard.release().await;
            });
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_graph_encode_100,
    bench_graph_decode_100,
    bench_graph_extract_100,
    bench_log_snapshot_10kb,
    bench_broadcast_100_sessions,
    bench_attach_release,
);
criterion_main!(benches);
