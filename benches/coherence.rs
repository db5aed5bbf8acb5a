// benches/coherence.rs -- Transfer costs of the coherence store.
//
//   cargo bench --bench coherence
//
// Every iteration invalidates the target representation with a host write
// so ensure-current performs a real transfer.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use heteroflow::prelude::*;
use std::sync::Arc;

// ============================================================
// Helpers
// ============================================================

fn simulated(name: &str, capabilities: DeviceCapabilities) -> ExecutionDevice {
    ExecutionDevice::accelerator(Arc::new(SimulatedDevice::with_capabilities(name, capabilities)))
}

fn make_image(size: u32, components: u32) -> Image {
    let bytes: Vec<u8> = (0..size * size * components).map(|i| (i % 251) as u8).collect();
    let image = Image::new();
    image
        .create_2d_with_data(
            size,
            size,
            ElementType::UInt8,
            components,
            &ExecutionDevice::host(),
            &bytes,
        )
        .expect("valid image");
    image
}

fn touch_on_host(image: &Image) {
    let access = image.image_access(AccessMode::ReadWrite).expect("host write");
    drop(access);
}

// ============================================================
// Benchmarks
// ============================================================

fn bench_host_to_device(c: &mut Criterion) {
    let device = simulated("bench", DeviceCapabilities::new(DeviceKind::Gpu));

    let mut group = c.benchmark_group("host_to_device");
    for size in [64u32, 256, 1024] {
        let image = make_image(size, 1);
        group.throughput(Throughput::Bytes(u64::from(size * size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                touch_on_host(&image);
                image.base().store().ensure_current(&device).expect("transfer");
            })
        });
    }
    group.finish();
}

fn bench_three_channel_padding(c: &mut Criterion) {
    let padded = simulated("padded", DeviceCapabilities::new(DeviceKind::Gpu));
    let native = simulated(
        "native",
        DeviceCapabilities::new(DeviceKind::Gpu).with_three_channel_surfaces(),
    );
    let image = make_image(256, 3);

    let mut group = c.benchmark_group("three_channel_256");
    group.bench_function("padded", |b| {
        b.iter(|| {
            touch_on_host(&image);
            image.base().store().ensure_current(&padded).expect("transfer");
        })
    });
    group.bench_function("native", |b| {
        b.iter(|| {
            touch_on_host(&image);
            image.base().store().ensure_current(&native).expect("transfer");
        })
    });
    group.finish();
}

fn bench_device_to_device(c: &mut Criterion) {
    let capabilities = DeviceCapabilities::new(DeviceKind::Gpu).with_peer_group(1);
    let first = simulated("peer-0", capabilities.clone());
    let second = simulated("peer-1", capabilities);
    let staged = simulated("staged", DeviceCapabilities::new(DeviceKind::Gpu));
    let image = make_image(512, 1);

    let write_on = |device: &ExecutionDevice| {
        let access = image
            .device_access(AccessMode::ReadWrite, device)
            .expect("device write");
        drop(access);
    };

    let mut group = c.benchmark_group("device_to_device_512");
    group.bench_function("peer", |b| {
        b.iter(|| {
            write_on(&first);
            image.base().store().ensure_current(&second).expect("transfer");
        })
    });
    group.bench_function("through_host", |b| {
        b.iter(|| {
            write_on(&first);
            image.base().store().ensure_current(&staged).expect("transfer");
        })
    });
    group.finish();
}

fn bench_pipeline_update(c: &mut Criterion) {
    let mut pipeline = Pipeline::new("bench", PipelineContext::default());
    pipeline.add_stage("pattern", PatternSource::new(256, 256));
    pipeline.add_stage("invert", ImageKernel::invert());
    pipeline.add_stage("statistics", StatisticsSink::new());
    pipeline.connect("pattern", 0, "invert", 0).expect("connect");
    pipeline.connect("invert", 0, "statistics", 0).expect("connect");

    let mut timestep = 0u64;
    c.bench_function("pipeline_update_256", |b| {
        b.iter(|| {
            timestep += 1;
            pipeline
                .update(timestep, StreamingMode::default())
                .expect("update");
        })
    });
}

criterion_group!(
    benches,
    bench_host_to_device,
    bench_three_channel_padding,
    bench_device_to_device,
    bench_pipeline_update
);
criterion_main!(benches);
