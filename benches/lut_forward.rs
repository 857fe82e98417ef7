//! LUT forward throughput for bit-packed and real-valued inputs.
//!
//! Run: `cargo bench --bench lut_forward`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bitbrain::layers::{BinaryLut6, StochasticLut6};
use bitbrain::{DataType, FrameBuffer, Model};

fn random_input(frames: usize, nodes: usize, data_type: DataType) -> FrameBuffer {
    let mut rng = StdRng::seed_from_u64(1);
    let mut x = FrameBuffer::new(frames, &[nodes], data_type);
    for frame in 0..frames {
        for node in 0..nodes {
            x.set_fp32(frame, node, rng.gen_range(0.0..1.0));
        }
    }
    x
}

fn bench_binary_lut(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_lut6");
    for frames in [256, 4096] {
        let mut lut = BinaryLut6::new(&[1024], 1);
        lut.set_input_shape(&[1024]);
        for data_type in [DataType::Bit, DataType::Fp32] {
            let x = random_input(frames, 1024, data_type);
            group.bench_with_input(
                BenchmarkId::new(format!("{data_type:?}"), frames),
                &x,
                |b, x| b.iter(|| black_box(lut.forward(x.clone(), false))),
            );
        }
    }
    group.finish();
}

fn bench_stochastic_lut(c: &mut Criterion) {
    let mut group = c.benchmark_group("stochastic_lut6");
    for frames in [256, 4096] {
        let mut lut = StochasticLut6::new(&[1024], 1);
        lut.set_input_shape(&[1024]);
        let x = random_input(frames, 1024, DataType::Fp32);
        group.bench_with_input(BenchmarkId::from_parameter(frames), &x, |b, x| {
            b.iter(|| black_box(lut.forward(x.clone(), true)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_binary_lut, bench_stochastic_lut);
criterion_main!(benches);
