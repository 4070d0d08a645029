//! Worker selection and per-worker connection accounting.
//!
//! The load balancer owns one record per worker process. A record is reserved
//! by [`LoadBalancer::select`] and released when the worker reports that it
//! has finished the request (the connection-closed signal).

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    error::LoadBalancerError,
    protocol::{WorkerMessage, decode_worker_message},
    worker::{WorkerHandle, WorkerId},
};

/// Strategy used to pick a worker for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    Random,
    RoundRobin,
    LeastConnections,
    IpHash,
}

impl Policy {
    /// Parses a policy tag. Unrecognized tags fall back to [`Policy::Random`].
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "random" => Policy::Random,
            "round-robin" | "round_robin" | "rr" => Policy::RoundRobin,
            "least-connections" | "least_connections" => Policy::LeastConnections,
            "ip-hash" | "ip_hash" => Policy::IpHash,
            other => {
                warn!("Unknown load balancing policy '{}', using random", other);
                Policy::Random
            }
        }
    }
}

/// Mutable load figures for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub active_connections: usize,
    pub last_used_at: Option<Instant>,
}

#[derive(Debug)]
struct WorkerRecord {
    handle: Arc<WorkerHandle>,
    stats: WorkerStats,
}

#[derive(Debug)]
struct PoolState {
    records: Vec<WorkerRecord>,
    /// Round-robin position, persists across calls.
    cursor: usize,
}

/// Picks a worker per request and tracks how many requests each worker holds.
///
/// The whole pool sits behind one mutex: selection reads every record for
/// least-connections, and the pick and the reservation must not interleave
/// with another `select` or `release`.
#[derive(Debug)]
pub struct LoadBalancer {
    state: Mutex<PoolState>,
}

impl LoadBalancer {
    /// Creates a load balancer over an already provisioned worker pool.
    ///
    /// # Arguments
    ///
    /// * `handles` - The workers, in pool order. Pool order is the iteration
    ///   order used for round-robin and for least-connections tie-breaks.
    pub fn new(handles: Vec<Arc<WorkerHandle>>) -> Self {
        let records = handles
            .into_iter()
            .map(|handle| WorkerRecord {
                handle,
                stats: WorkerStats::default(),
            })
            .collect();
        Self {
            state: Mutex::new(PoolState { records, cursor: 0 }),
        }
    }

    pub fn handle(&self, id: WorkerId) -> Option<Arc<WorkerHandle>> {
        self.lock()
            .records
            .iter()
            .find(|r| r.handle.id() == id)
            .map(|r| r.handle.clone())
    }

    pub fn stats(&self, id: WorkerId) -> Option<WorkerStats> {
        self.lock()
            .records
            .iter()
            .find(|r| r.handle.id() == id)
            .map(|r| r.stats)
    }

    /// Selects a worker and reserves a connection slot on it.
    ///
    /// # Arguments
    ///
    /// * `policy` - The selection strategy
    /// * `client_address` - Dotted-decimal client address, used by [`Policy::IpHash`]
    ///
    /// # Returns
    ///
    /// The chosen worker with its `active_connections` already incremented and
    /// `last_used_at` stamped, or [`LoadBalancerError::NoWorkersAvailable`] for an
    /// empty pool.
    pub fn select(
        &self,
        policy: Policy,
        client_address: Option<&str>,
    ) -> Result<Arc<WorkerHandle>, LoadBalancerError> {
        let mut state = self.lock();
        let len = state.records.len();
        if len == 0 {
            return Err(LoadBalancerError::NoWorkersAvailable);
        }

        let index = match policy {
            Policy::Random => rand::thread_rng().gen_range(0..len),
            Policy::RoundRobin => {
                let index = state.cursor % len;
                state.cursor = (index + 1) % len;
                index
            }
            Policy::LeastConnections => least_connections_index(&state.records),
            Policy::IpHash => (ip_hash(client_address.unwrap_or_default()) % len as u64) as usize,
        };

        let record = &mut state.records[index];
        record.stats.active_connections += 1;
        record.stats.last_used_at = Some(Instant::now());
        debug!(
            "Selected worker {} ({:?}), active connections: {}",
            record.handle.id(),
            policy,
            record.stats.active_connections
        );

        Ok(record.handle.clone())
    }

    /// Releases one connection slot on a worker. Never goes below zero.
    pub fn release(&self, id: WorkerId) {
        let mut state = self.lock();
        match state.records.iter_mut().find(|r| r.handle.id() == id) {
            Some(record) => {
                record.stats.active_connections = record.stats.active_connections.saturating_sub(1);
                debug!(
                    "Released worker {}, active connections: {}",
                    id, record.stats.active_connections
                );
            }
            None => warn!("Release for unknown worker {}", id),
        }
    }

    /// Accounting hook for every raw message a worker sends.
    ///
    /// Only the connection-closed signal is acted on; replies and undecodable
    /// lines are left to the dispatcher.
    pub fn on_worker_message(&self, id: WorkerId, raw: &str) {
        if let Ok(WorkerMessage::ConnectionClosed) = decode_worker_message(raw) {
            self.release(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First worker in pool order holding the fewest active connections.
fn least_connections_index(records: &[WorkerRecord]) -> usize {
    let mut best = 0;
    for (index, record) in records.iter().enumerate() {
        if record.stats.active_connections < records[best].stats.active_connections {
            best = index;
        }
    }
    best
}

/// Sum of the dotted-decimal octets. Octets that do not parse count as 0, and
/// anything other than four octets hashes to 0.
fn ip_hash(address: &str) -> u64 {
    let octets: Vec<&str> = address.split('.').collect();
    if octets.len() != 4 {
        return 0;
    }
    octets
        .iter()
        .map(|octet| octet.trim().parse::<u64>().unwrap_or(0))
        .fold(0u64, u64::wrapping_add)
}
