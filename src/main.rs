// Copyright 2026 xspress-streamer contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use xspress_streamer::config::load_config_with_env;
use xspress_streamer::distribution::{spawn_publisher, ChannelSink};
use xspress_streamer::engine::AcquisitionEngine;
use xspress_streamer::monitor::{MonitorCache, MonitorServer};
use xspress_streamer::source::SimSource;
use xspress_streamer::writer::{run_forwarder, spawn_writer};
use xspress_streamer::ControlInterface;

/// Xspress3 streamer - acquire detector frames and distribute them over Zenoh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Device ID (overrides config file)
    #[arg(short, long)]
    device_id: Option<String>,

    /// Also run the HDF5 writing receiver in-process
    #[arg(long)]
    with_writer: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config_with_env(&args.config)?;

    if let Some(device_id) = args.device_id {
        config.streamer.device_id = device_id;
    }

    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Xspress3 streamer");
    info!("Loaded configuration from: {:?}", args.config);
    info!("Device ID: {}", config.streamer.device_id);
    info!(
        "Source: {} ({} channels x {} bins)",
        config.source.kind, config.source.channels, config.source.bins
    );

    let zenoh_config = config.zenoh.to_session_config()?;
    let session = zenoh::open(zenoh_config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open Zenoh session: {}", e))?;

    info!("Zenoh session opened");

    let source = SimSource::new(
        config.source.channels,
        config.source.bins,
        Duration::from_micros(config.source.frame_period_us),
    );

    let (sink, outbound) = ChannelSink::new(
        config.streamer.queue_capacity,
        config.streamer.backpressure,
        config.streamer.publish_timeout(),
    );
    let publisher = spawn_publisher(session.clone(), config.streamer.data_key(), outbound);

    let monitor_cache = Arc::new(MonitorCache::new());
    let (engine, acquisition) = AcquisitionEngine::spawn(
        Box::new(source),
        Box::new(sink),
        monitor_cache.clone(),
        config.streamer.engine_options(),
    );

    let monitor_server = MonitorServer::new(
        session.clone(),
        monitor_cache,
        config.streamer.monitor_key(),
    );
    let monitor_task = tokio::spawn(async move {
        if let Err(e) = monitor_server.run().await {
            error!("Monitor server error: {}", e);
        }
    });

    let mut writer = None;
    if args.with_writer {
        let (tx, stats, handle) = spawn_writer(
            config.writer.writer_config(),
            config.writer.queue_capacity,
        );
        let forwarder_session = session.clone();
        let data_key = config.streamer.data_key();
        let forwarder = tokio::spawn(async move {
            if let Err(e) = run_forwarder(forwarder_session, data_key, tx, stats).await {
                error!("Writer forwarder error: {}", e);
            }
        });
        writer = Some((forwarder, handle));
        info!("In-process writer enabled, output: {}", config.writer.output_dir);
    }

    let control = ControlInterface::new(
        session.clone(),
        engine.clone(),
        config.streamer.control_key(),
    );

    info!("Control interface on {}", config.streamer.control_key());

    tokio::select! {
        result = control.run() => {
            if let Err(e) = result {
                error!("Control interface error: {}", e);
            }
            info!("Control interface stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    monitor_task.abort();

    // Finish any active session, then take the acquisition thread down.
    if let Err(e) = engine.stop() {
        error!("Stop on shutdown failed: {}", e);
    }
    engine.shutdown();
    if acquisition.join().is_err() {
        error!("Acquisition thread panicked");
    }

    // Engine shutdown drops the sink, which disconnects the publisher.
    if publisher.join().is_err() {
        error!("Publisher thread panicked");
    }

    // Aborting the forwarder drops the writer's sender, letting the writer
    // thread finalize the open file and exit.
    if let Some((forwarder, handle)) = writer {
        forwarder.abort();
        if handle.join().is_err() {
            error!("Writer thread panicked");
        }
    }

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;

    info!("Xspress3 streamer shut down");

    Ok(())
}
