//! Worker process provisioning and the line-oriented channel to each worker.

use std::{process::Stdio, sync::Arc};

use anyhow::{Context as _, Result};
use futures::future::join_all;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tracing::{debug, error, info};

use crate::{
    config::{Config, WORKER_CONFIG_ENV, WORKER_ID_ENV},
    worker::{WorkerHandle, WorkerId},
};

/// Something a worker channel produced, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Line(WorkerId, String),
    /// The worker's output reached EOF or failed.
    Closed(WorkerId),
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Live worker processes and their handles, in pool order.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<Arc<WorkerHandle>>,
    children: Vec<Child>,
}

impl WorkerPool {
    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.handles.clone()
    }

    /// Kills every worker process and waits for them to exit.
    pub async fn shutdown(mut self) {
        let results = join_all(self.children.iter_mut().map(|child| child.kill())).await;
        for result in results {
            if let Err(e) = result {
                error!("Failed to stop worker: {}", e);
            }
        }
    }
}

/// Spawns `count` workers running the current executable.
///
/// Each child receives the configuration and its id through the environment
/// and talks to the master over its stdin/stdout. Worker ids run 1..=count.
pub fn spawn_workers(config: &Config, count: usize, inbound: InboundSender) -> Result<WorkerPool> {
    let exe = std::env::current_exe().context("locating the fleet executable")?;
    let config_value = config
        .to_env_value()
        .context("serializing configuration for workers")?;

    let mut handles = Vec::with_capacity(count);
    let mut children = Vec::with_capacity(count);

    for n in 1..=count {
        let id = WorkerId(n as u32);
        let mut child = Command::new(&exe)
            .env(WORKER_CONFIG_ENV, &config_value)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning worker {}", id))?;

        let stdin = child.stdin.take().context("worker stdin is not piped")?;
        let stdout = child.stdout.take().context("worker stdout is not piped")?;

        handles.push(attach(id, stdout, stdin, inbound.clone()));
        children.push(child);
        info!("Master process: worker {} spun up (pid {:?})", id, children[n - 1].id());
    }

    Ok(WorkerPool { handles, children })
}

/// Wires a byte stream pair as a worker channel.
///
/// A writer task drains the handle's outbound lines into `writer`; a reader
/// task forwards each line read from `reader` to `inbound`, followed by
/// [`Inbound::Closed`] once the stream ends.
pub fn attach<R, W>(id: WorkerId, reader: R, writer: W, inbound: InboundSender) -> Arc<WorkerHandle>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let handle = Arc::new(WorkerHandle::new(id, outbound_tx));

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!("Failed to write to worker {}: {}", id, e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush to worker {}: {}", id, e);
                break;
            }
        }
        debug!("Writer for worker {} stopped", id);
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if inbound.send(Inbound::Line(id, line)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    error!("Worker {} closed its channel", id);
                    break;
                }
                Err(e) => {
                    error!("Failed to read from worker {}: {}", id, e);
                    break;
                }
            }
        }
        let _ = inbound.send(Inbound::Closed(id));
    });

    handle
}
