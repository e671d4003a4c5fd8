// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Benchmarks for pooled versus unpooled buffer allocation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memory_manager::{Capacity, DeviceMemoryManager, HostMemoryManager, MemoryManager, MemoryPool};

const SIDES: [usize; 3] = [64, 512, 2048];

fn bench_unpooled(c: &mut Criterion) {
    let manager = DeviceMemoryManager::new(Capacity::unlimited());
    let mut group = c.benchmark_group("unpooled");
    for side in SIDES {
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, &side| {
            b.iter(|| {
                let ptr = manager.make_ptr_2d::<f32>(side, side).unwrap();
                black_box(ptr.address());
            })
        });
    }
    group.finish();
}

fn bench_pooled(c: &mut Criterion) {
    let pool = MemoryPool::new(DeviceMemoryManager::new(Capacity::unlimited()));
    let mut group = c.benchmark_group("pooled");
    for side in SIDES {
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, &side| {
            b.iter(|| {
                let image = pool.acquire::<f32>(side, side, 1).unwrap();
                black_box(image.address());
            })
        });
    }
    group.finish();
}

fn bench_host_to_device(c: &mut Criterion) {
    let host = HostMemoryManager::new(Capacity::unlimited());
    let device = MemoryPool::new(DeviceMemoryManager::new(Capacity::unlimited()));
    let mut src = host.make_ptr_2d::<f32>(1024, 1024).unwrap();
    src.fill(1.0);

    c.bench_function("host_to_device_1024", |b| {
        b.iter(|| {
            let mut dst = device.acquire::<f32>(1024, 1024, 1).unwrap();
            dst.copy_from(&src).unwrap().wait().unwrap();
        })
    });
}

criterion_group!(benches, bench_unpooled, bench_pooled, bench_host_to_device);
criterion_main!(benches);
