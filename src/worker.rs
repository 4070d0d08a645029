//! Master-side handle to one worker process.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    error::WorkerError,
    protocol::{ForwardRequest, WorkerMessage, WorkerReply, decode_worker_message, encode_request},
};

/// Stable identity of a worker. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a dispatched request ended, as seen from the worker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Reply(WorkerReply),
    /// The closed signal arrived without a reply, or the worker went away.
    Aborted,
    /// The worker sent something that is not a valid message.
    Malformed(String),
}

#[derive(Debug)]
struct Pending {
    reply: Option<oneshot::Sender<Completion>>,
    answered: bool,
}

/// A worker's identity plus its outbound line queue and the FIFO of requests
/// still waiting on it.
///
/// Workers answer in send order, so the first unanswered entry owns the next
/// reply and the front entry owns the next closed signal.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<VecDeque<Pending>>,
    /// Set once the worker's channel has ended; only written under `pending`.
    closed: AtomicBool,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            outbound,
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Number of requests sent to this worker whose closed signal has not arrived.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Sends a request and returns the one-shot slot its outcome lands in.
    pub fn send(
        &self,
        request: &ForwardRequest,
    ) -> Result<oneshot::Receiver<Completion>, WorkerError> {
        let line = encode_request(request)?;
        let (tx, rx) = oneshot::channel();

        // Held across the send so queue order matches channel order.
        let mut pending = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::ChannelClosed(self.id));
        }
        self.outbound
            .send(line)
            .map_err(|_| WorkerError::ChannelClosed(self.id))?;
        pending.push_back(Pending {
            reply: Some(tx),
            answered: false,
        });
        Ok(rx)
    }

    /// Routes one raw line from the worker to the request it belongs to.
    pub fn deliver(&self, line: &str) {
        let mut pending = self.lock();

        match decode_worker_message(line) {
            Ok(WorkerMessage::Reply(reply)) => {
                match pending.iter_mut().find(|p| !p.answered) {
                    Some(entry) => {
                        entry.answered = true;
                        self.complete(entry, Completion::Reply(reply));
                    }
                    None => warn!("Worker {} sent a reply nobody is waiting for", self.id),
                }
            }
            Ok(WorkerMessage::ConnectionClosed) => match pending.pop_front() {
                Some(mut entry) if !entry.answered => {
                    self.complete(&mut entry, Completion::Aborted);
                }
                Some(_) => {}
                None => warn!("Worker {} sent a closed signal with nothing pending", self.id),
            },
            Err(e) => {
                warn!("Worker {} sent an undecodable message: {}", self.id, e);
                if let Some(entry) = pending.iter_mut().find(|p| !p.answered) {
                    entry.answered = true;
                    self.complete(entry, Completion::Malformed(e.to_string()));
                }
            }
        }
    }

    /// Marks the worker as gone and fails every outstanding request.
    ///
    /// Later sends fail with [`WorkerError::ChannelClosed`]. Returns the number
    /// of requests drained, each of which still holds a load balancer slot.
    pub fn abort_pending(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut pending = self.lock();
            self.closed.store(true, Ordering::Release);
            pending.drain(..).collect()
        };
        let count = drained.len();
        for mut entry in drained {
            if !entry.answered {
                self.complete(&mut entry, Completion::Aborted);
            }
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn complete(&self, entry: &mut Pending, completion: Completion) {
        if let Some(tx) = entry.reply.take() {
            if tx.send(completion).is_err() {
                debug!("Request on worker {} was abandoned before completion", self.id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
