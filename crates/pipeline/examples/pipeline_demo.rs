// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! A three-stage pipeline: load frames on the host, process them on the
//! device, and collect the results.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p pipeline --example pipeline_demo
//! ```

use buffer_core::{DType, MemorySpace};
use memory_manager::MemoryManager;
use pipeline::{PipelineConfig, PipelineContext, StageConfig};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const WIDTH: usize = 640;
const HEIGHT: usize = 480;
const FRAMES: usize = 32;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mut config = PipelineConfig::from_toml(
        r#"
device_capacity = "64M"
host_capacity = "64M"
copy_mode = "async"
"#,
    )?;
    for (name, space, count) in [
        ("load", MemorySpace::Host, 3),
        ("process", MemorySpace::Device, 3),
        ("collect", MemorySpace::Host, 1),
    ] {
        config.stages.push(StageConfig {
            name: name.into(),
            space,
            dtype: DType::F32,
            width: WIDTH,
            height: HEIGHT,
            depth: 1,
            count,
        });
    }

    let ctx = Arc::new(PipelineContext::new(config)?);
    ctx.register_all()?;

    let (tx, rx) = mpsc::sync_channel(2);
    let loader = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || -> anyhow::Result<()> {
            for frame in 0..FRAMES {
                let mut image = ctx.acquire_host::<f32>("load", Some(Duration::from_secs(5)))?;
                image.fill(frame as f32);
                tx.send(image)
                    .map_err(|_| anyhow::anyhow!("processing stage hung up"))?;
            }
            Ok(())
        })
    };

    let mut checksum = 0.0f64;
    for host_frame in rx {
        let mut on_device = ctx.acquire_device::<f32>("process", Some(Duration::from_secs(5)))?;
        on_device.copy_from(&host_frame)?;
        drop(host_frame);

        let mut result = ctx.acquire_host::<f32>("collect", Some(Duration::from_secs(5)))?;
        on_device.copy_to(&mut result)?.wait()?;
        checksum += f64::from(result.row(0, 0)[0]);
    }
    loader
        .join()
        .map_err(|_| anyhow::anyhow!("loader thread panicked"))??;

    let (device, host) = ctx.stats();
    tracing::info!("device {}", device.summary());
    tracing::info!("host {}", host.summary());
    tracing::info!(
        "{FRAMES} frames, checksum {checksum}, {} device allocations",
        ctx.device().manager().allocation_count()
    );

    let ctx = Arc::try_unwrap(ctx).map_err(|_| anyhow::anyhow!("context still shared"))?;
    ctx.teardown()?;
    Ok(())
}
