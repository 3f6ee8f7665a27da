//! Offline-render throughput benchmarks.

use criterion::{Criterion, criterion_group, criterion_main};

use corriente_core::{Driver, MemorySink, Server, ServerConfig};
use corriente_dsp::{Biquad, Sine};

fn bench_offline_render(c: &mut Criterion) {
    c.bench_function("render_filtered_sines_1s", |b| {
        b.iter(|| {
            let mut server = Server::new(ServerConfig {
                sample_rate: 44100,
                buffer_size: 256,
                channels: 2,
                ..ServerConfig::default()
            });
            server.boot(Driver::offline(MemorySink::new(), 1.0)).unwrap();
            let osc = server
                .add(Sine::new().freq([110.0, 220.0, 330.0, 440.0]).mul(0.2))
                .unwrap();
            let flt = server.add(Biquad::new(osc).freq(2000.0)).unwrap();
            let mixed = flt.mix(&mut server, 2).unwrap();
            mixed.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
            server.start().unwrap();
        });
    });
}

criterion_group!(benches, bench_offline_render);
criterion_main!(benches);
