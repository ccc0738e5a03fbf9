#[path = "../tests/common/mod.rs"]
mod common;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;

use common::{BufferSpec, Fixture, TestBuffer};
use hwcomposer::utils::{LayerId, Rectangle};

const LAYERS: usize = 64;

fn populate(fx: &mut Fixture, buffers: &[TestBuffer]) -> Vec<LayerId> {
    let mut rand = rand::thread_rng();
    let mut ids = Vec::with_capacity(buffers.len());
    for (z, buffer) in buffers.iter().enumerate() {
        let spec = BufferSpec {
            width: rand.gen_range(64..=1080),
            height: rand.gen_range(64..=2400),
            ..Default::default()
        };
        let id = fx.add_layer(buffer, spec);
        let x = rand.gen_range(0..1080 - spec.width as i32 + 1);
        let y = rand.gen_range(0..2400 - spec.height as i32 + 1);
        let layer = fx.session.layer_mut(id).unwrap();
        layer.set_display_frame(Rectangle::new(
            (x, y).into(),
            (spec.width as i32, spec.height as i32).into(),
        ));
        fx.session.set_layer_z_order(id, z as u32).unwrap();
        if rand.gen_bool(0.5) {
            fx.engine.script().hardware.insert(id);
        }
        ids.push(id);
    }
    ids
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffers: Vec<_> = (0..LAYERS as u64).map(|id| TestBuffer::new(id + 1)).collect();
    let ids = populate(&mut fx, &buffers);
    let mut rand = rand::thread_rng();

    c.bench_function("frame_unchanged_64", |b| {
        b.iter(|| {
            fx.frame();
        });
    });

    c.bench_function("frame_restacked_64", |b| {
        b.iter(|| {
            let id = ids[rand.gen_range(0..ids.len())];
            fx.session.set_layer_z_order(id, rand.gen_range(0..LAYERS as u32)).unwrap();
            fx.frame();
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
