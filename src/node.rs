//! The worker process: decode a forward-request, route it, forward it, answer.

use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use crate::{
    config::Config,
    protocol::{WorkerMessage, WorkerReply, decode_request, encode_worker_message},
    router::resolve,
    upstream::Forwarder,
    worker::WorkerId,
};

/// Request handling state of one worker.
#[derive(Debug, Clone)]
pub struct Node {
    id: WorkerId,
    config: Arc<Config>,
    forwarder: Forwarder,
}

impl Node {
    pub fn new(id: WorkerId, config: Config) -> Self {
        let forwarder = Forwarder::new(Duration::from_millis(config.server.upstream_timeout_ms));
        Self {
            id,
            config: Arc::new(config),
            forwarder,
        }
    }

    /// Turns one raw forward-request line into the reply for it.
    ///
    /// Never fails: every problem becomes an error reply.
    pub async fn handle_message(&self, raw: &str) -> WorkerReply {
        let request = match decode_request(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting malformed request: {}", e);
                return WorkerReply::internal_error();
            }
        };

        let upstream = match resolve(&request.path, &self.config.rules, &self.config.upstreams) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Routing failed for {}: {}", request.path, e);
                return WorkerReply::from_route_error(&e);
            }
        };

        debug!("Routing {} to upstream {}", request.path, upstream.id);
        match self
            .forwarder
            .forward(upstream, &request.path, &request.headers)
            .await
        {
            Ok(data) => WorkerReply::Data(data),
            Err(e) => {
                error!("Forwarding {} to {} failed: {}", request.path, upstream.id, e);
                WorkerReply::from_forward_error(&e)
            }
        }
    }

    /// Serves requests from `reader` one at a time until it reaches EOF.
    ///
    /// Each request produces exactly two lines on `writer`: the reply, then the
    /// connection-closed signal.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.context("reading from master")? {
            if line.trim().is_empty() {
                continue;
            }

            let reply = self.handle_message(&line).await;
            let output = exchange_lines(reply)?;
            writer
                .write_all(output.as_bytes())
                .await
                .context("writing to master")?;
            writer.flush().await.context("flushing to master")?;
        }

        info!("Master closed the channel, worker {} exiting", self.id);
        Ok(())
    }
}

/// The reply line followed by the closed-signal line.
fn exchange_lines(reply: WorkerReply) -> Result<String> {
    let mut output = match encode_worker_message(&WorkerMessage::Reply(reply)) {
        Ok(line) => line,
        Err(e) => {
            error!("Could not encode reply: {}", e);
            encode_worker_message(&WorkerMessage::Reply(WorkerReply::internal_error()))?
        }
    };
    output.push_str(&encode_worker_message(&WorkerMessage::ConnectionClosed)?);
    Ok(output)
}

/// Entry point of a worker process: IPC on stdin/stdout.
pub async fn run(id: WorkerId, config: Config) -> Result<()> {
    let node = Node::new(id, config);
    let span = info_span!("worker", id = %id);

    async move {
        info!("Worker node ready");
        node.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }
    .instrument(span)
    .await
}
