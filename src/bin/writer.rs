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

// Standalone HDF5 writing receiver: subscribes to a streamer's data key
// and persists each session to disk.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use xspress_streamer::config::load_config_with_env;
use xspress_streamer::writer::{run_forwarder, spawn_writer};

/// Xspress3 writer - receive frame streams over Zenoh and write HDF5 files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Device ID to subscribe to (overrides config file)
    #[arg(short, long)]
    device_id: Option<String>,

    /// Output directory (overrides config file)
    #[arg(short, long)]
    output_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config_with_env(&args.config)?;

    if let Some(device_id) = args.device_id {
        config.streamer.device_id = device_id;
    }
    if let Some(output_dir) = args.output_dir {
        config.writer.output_dir = output_dir;
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

    info!("Starting Xspress3 writer");
    info!("Subscribing to {}", config.streamer.data_key());
    info!("Output directory: {}", config.writer.output_dir);

    let zenoh_config = config.zenoh.to_session_config()?;
    let session = zenoh::open(zenoh_config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open Zenoh session: {}", e))?;

    info!("Zenoh session opened");

    let (tx, stats, writer) = spawn_writer(
        config.writer.writer_config(),
        config.writer.queue_capacity,
    );

    tokio::select! {
        result = run_forwarder(session.clone(), config.streamer.data_key(), tx, stats) => {
            if let Err(e) = result {
                error!("Forwarder error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // The select arm dropped the forwarder future along with the writer's
    // sender; the writer finalizes any open file and exits.
    if writer.join().is_err() {
        error!("Writer thread panicked");
    }

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;

    info!("Xspress3 writer shut down");

    Ok(())
}
