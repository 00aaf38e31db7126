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
use tracing::{error, info};
use zenoh::query::Query;
use zenoh::Session;

use crate::engine::EngineHandle;
use crate::frame::{ExposureConfig, SessionConfig};
use crate::protocol::{ControlCommand, ControlRequest, ControlResponse};

/// Control surface for the acquisition engine via a zenoh queryable.
///
/// Every engine call goes through the bounded command handshake, so this
/// interface stays responsive no matter what the acquisition loop is doing.
pub struct ControlInterface {
    session: Session,
    engine: EngineHandle,
    key: String,
}

impl ControlInterface {
    pub fn new(session: Session, engine: EngineHandle, key: String) -> Self {
        Self {
            session,
            engine,
            key,
        }
    }

    /// Run the control interface (blocks until the session closes).
    pub async fn run(&self) -> Result<()> {
        let queryable = self
            .session
            .declare_queryable(&self.key)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        info!("Control interface listening on '{}'", self.key);

        while let Ok(query) = queryable.recv_async().await {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_query(query, engine).await {
                    error!("Error handling control query: {}", e);
                }
            });
        }

        Ok(())
    }
}

async fn handle_query(query: Query, engine: EngineHandle) -> Result<()> {
    let request: ControlRequest = match query.payload() {
        Some(payload) => match serde_json::from_slice(&payload.to_bytes()) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    ControlResponse::error(format!("bad request: {}", e), engine.status());
                return reply(&query, &response).await;
            }
        },
        None => {
            let response = ControlResponse::error("missing request payload", engine.status());
            return reply(&query, &response).await;
        }
    };

    info!("Control command: {:?}", request.command);

    let response = match request.command {
        ControlCommand::Status => ControlResponse::ok(engine.status()),
        ControlCommand::Configure => {
            let Some(capacity) = request.capacity else {
                let response =
                    ControlResponse::error("configure requires 'capacity'", engine.status());
                return reply(&query, &response).await;
            };
            let defaults = ExposureConfig::default();
            let config = SessionConfig {
                capacity,
                exposure: ExposureConfig {
                    frame_time_s: request.frame_time_s.unwrap_or(defaults.frame_time_s),
                    n_triggers: request.n_triggers.unwrap_or(defaults.n_triggers),
                },
                filename: request.filename.clone(),
                overwrite: request.overwrite.unwrap_or(false),
            };
            run_command(&engine, move |e| e.configure(config)).await
        }
        ControlCommand::Start => run_command(&engine, |e| e.start()).await,
        ControlCommand::Stop => run_command(&engine, |e| e.stop()).await,
        ControlCommand::Reset => run_command(&engine, |e| e.reset()).await,
    };

    reply(&query, &response).await
}

/// The engine handshake blocks (bounded), so keep it off the async runtime.
async fn run_command<F>(engine: &EngineHandle, f: F) -> ControlResponse
where
    F: FnOnce(&EngineHandle) -> Result<(), crate::error::EngineError> + Send + 'static,
{
    let worker = engine.clone();
    let result = tokio::task::spawn_blocking(move || f(&worker)).await;
    match result {
        Ok(Ok(())) => ControlResponse::ok(engine.status()),
        Ok(Err(e)) => ControlResponse::error(e.to_string(), engine.status()),
        Err(e) => ControlResponse::error(format!("control task failed: {}", e), engine.status()),
    }
}

async fn reply(query: &Query, response: &ControlResponse) -> Result<()> {
    let bytes = serde_json::to_vec(response)?;
    query
        .reply(query.key_expr().clone(), bytes)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}
