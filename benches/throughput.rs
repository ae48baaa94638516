//! Throughput Benchmark for echod
//!
//! This benchmark measures how fast a connection handler moves bytes over
//! the in-memory transport, with and without partial sends.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use echod::connection::{handle_connection, ConnectionStats, HandlerConfig};
use echod::sequence::LcgSequence;
use echod::transport::sim::{Chunking, SimAcceptor, SimOptions, SimTransport};
use echod::transport::{Acceptor, Transport};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// A simulated network with one listener reused across iterations.
struct Bench {
    net: SimTransport,
    acceptor: SimAcceptor,
}

impl Bench {
    fn new(options: SimOptions) -> Self {
        let net = SimTransport::with_options(Arc::new(LcgSequence::new(1)), options);
        let acceptor = net.listen("0.0.0.0:0".parse().unwrap(), 1).unwrap();
        Self { net, acceptor }
    }
}

/// Echo `payload` once over a fresh simulated connection.
async fn echo_once(bench: &mut Bench, payload: &[u8]) {
    let Bench { net, acceptor } = bench;
    let mut peer = net.connect(acceptor.local_addr().unwrap()).unwrap();
    let (conn, _) = acceptor.accept().await.unwrap();

    let handler = tokio::spawn(handle_connection(
        conn,
        HandlerConfig::default(),
        Arc::new(ConnectionStats::new()),
    ));

    peer.write(payload).unwrap();
    peer.shutdown_write();
    let echoed = peer.read_to_end().await.unwrap();
    assert_eq!(echoed.len(), payload.len());

    handler.await.unwrap();
}

fn bench_echo(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("echo");

    for (name, size) in [("small", 64usize), ("segment", 1460), ("large", 64 * 1024)] {
        let payload = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        let mut whole = Bench::new(SimOptions::default());
        group.bench_function(format!("{name}_whole_sends"), |b| {
            b.iter(|| rt.block_on(echo_once(&mut whole, &payload)));
        });

        let mut chunked = Bench::new(
            SimOptions {
                chunking: Chunking::Random { max: 512, seed: 9 },
                ..SimOptions::default()
            },
        );
        group.bench_function(format!("{name}_partial_sends"), |b| {
            b.iter(|| rt.block_on(echo_once(&mut chunked, &payload)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_echo);
criterion_main!(benches);
