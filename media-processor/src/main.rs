//! Media Processor - transcoding worker
// Copyright 2025 Francisco F. Pinochet
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
use cinecore_config::PipelineConfig;
use cinecore_logging::{init_with_format, LogFormat};
use cinecore_types::TaskName;
use media_processor::pipeline::Pipeline;
use media_processor::server::ApiServer;
use media_processor::store::{JobStore, MemoryJobStore, PgJobStore};
use media_processor::worker::TaskWorker;
use std::sync::Arc;
use std::time::Duration;
use task_queue_client::{NatsTaskQueue, PeriodicScheduler, TaskQueue};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = PipelineConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging
    init_with_format(
        "media-processor",
        config.log_level(),
        LogFormat::parse(config.log_format.as_deref()),
    );

    info!(worker = %config.worker.name, "Starting Media Processor");

    config
        .validate_tools()
        .map_err(|e| anyhow::anyhow!("Invalid tool configuration: {}", e))?;

    info!(
        message_bus_url = config.message_bus_url(),
        lanes = ?config.worker.lanes,
        "Configuration loaded"
    );

    let store: Arc<dyn JobStore> = match &config.database.url {
        Some(url) => {
            let store = PgJobStore::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
            info!("Using PostgreSQL job store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, job records are kept in memory");
            Arc::new(MemoryJobStore::new())
        }
    };

    // Connect to the task queue
    let queue = NatsTaskQueue::new(
        &config.message_bus,
        Duration::from_secs(config.worker.ack_wait_secs),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to connect to message bus: {}", e))?;
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);

    info!("Connected to message bus");

    let shutdown = CancellationToken::new();

    let scheduler_handles = if config.worker.scheduler {
        let r = &config.reconcile;
        PeriodicScheduler::new()
            .every(
                TaskName::CheckRunningStates,
                Duration::from_secs(r.running_interval_secs),
            )
            .every(
                TaskName::CheckPendingStates,
                Duration::from_secs(r.pending_interval_secs),
            )
            .every(
                TaskName::CheckMissingProfiles,
                Duration::from_secs(r.missing_profiles_interval_secs),
            )
            .every(
                TaskName::CheckMediaStates,
                Duration::from_secs(r.media_states_interval_secs),
            )
            .spawn(queue.clone(), shutdown.clone())
    } else {
        Vec::new()
    };

    let http_port = config.worker.http_port;
    let pipeline = Pipeline::new(config, store, queue);

    // Start HTTP server in background
    let server = ApiServer::new(http_port, pipeline.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!(error = %e, "HTTP server error");
        }
    });

    // Start consuming tasks
    info!("Starting task processing");
    let worker = TaskWorker::new(pipeline, shutdown.clone());
    let worker_handle = tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            error!(error = %e, "Worker error");
        }
    });

    // Wait for shutdown signal
    info!("Media Processor running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }
    shutdown.cancel();

    // Graceful shutdown: wait for in-flight tasks to finish
    info!("Waiting for in-flight tasks to complete...");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            warn!("Shutdown timeout reached, forcing shutdown");
        }
        _ = worker_handle => {
            info!("Worker completed gracefully");
        }
    }

    for handle in scheduler_handles {
        handle.abort();
    }
    server_handle.abort();
    info!("Media Processor stopped");

    Ok(())
}
