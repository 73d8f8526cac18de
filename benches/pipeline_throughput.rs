//! Pipeline throughput benchmarks.
//!
//! Measures full signed calls (verify, invoke, sign) and chunk encoding of
//! sequence results.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use serde_json::{json, Value};

use commune_server::client::CallBuilder;
use commune_server::identity::{Keypair, ServerIdentity};
use commune_server::module::builtin::default_module;
use commune_server::module::{Output, ServedModule};
use commune_server::pipeline::{split_chunks, PipelineConfig, PipelineResponse, RequestPipeline};

fn pipeline(module: ServedModule, chunk_size: usize) -> RequestPipeline {
    let identity = Arc::new(ServerIdentity::new(
        Keypair::generate(),
        "bench",
        "127.0.0.1",
        8888,
    ));
    let config = PipelineConfig {
        chunk_size,
        save_history: false,
        ..Default::default()
    };
    RequestPipeline::new(config, identity, Arc::new(module))
}

fn bench_signed_call(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pipeline = pipeline(default_module("bench"), 1000);
    let caller = Keypair::generate();
    let mut group = c.benchmark_group("signed_call");

    for (name, args) in [("small", 2usize), ("medium", 64), ("large", 1024)] {
        let values: Vec<Value> = (0..args).map(|i| json!(i)).collect();
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("echo", name), |b| {
            b.to_async(&runtime).iter(|| async {
                let mut call = CallBuilder::new();
                for value in &values {
                    call = call.arg(value.clone());
                }
                let response = pipeline.handle("echo", call.sign(&caller)).await;
                assert!(matches!(response, PipelineResponse::Signed(_)));
                black_box(response)
            })
        });
    }

    group.finish();
}

fn bench_stream_encoding(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("stream_encoding");

    for chunk_size in [64usize, 1000, 16 * 1024] {
        let module = ServedModule::new("bench").blocking("rows", |_| {
            Ok(Output::iter(
                (0..256).map(|i| json!({"row": i, "text": "x".repeat(200)})),
            ))
        });
        let pipeline = pipeline(module, chunk_size);
        let caller = Keypair::generate();

        group.throughput(Throughput::Elements(256));
        group.bench_function(BenchmarkId::new("rows", chunk_size), |b| {
            b.to_async(&runtime).iter(|| async {
                let response = pipeline.handle("rows", CallBuilder::new().sign(&caller)).await;
                let PipelineResponse::Stream(chunks) = response else {
                    panic!("expected stream");
                };
                black_box(chunks.count().await)
            })
        });
    }

    group.finish();
}

fn bench_split_chunks(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_chunks");
    let text = "é".repeat(32 * 1024);

    for chunk_size in [16usize, 1000, 8192] {
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk_size), &chunk_size, |b, &size| {
            b.iter(|| black_box(split_chunks(black_box(&text), size)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_signed_call,
    bench_stream_encoding,
    bench_split_chunks
);
criterion_main!(benches);
