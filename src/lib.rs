//! Fleet - a multi-process HTTP load balancer
//!
//! A master process accepts HTTP connections and hands each request to one
//! of several long-lived worker processes, chosen by a load-balancing
//! policy. The worker routes the request to a configured upstream, forwards
//! it, and relays the body back through the master.
//!
//! The main components are organized into the following modules:
//! - `config`: Configuration loading, validation and hand-off to workers
//! - `protocol`: Messages exchanged between master and workers
//! - `worker`: Master-side handle to one worker and its pending requests
//! - `load_balancer`: Worker selection policies and connection accounting
//! - `router`: Path to upstream resolution inside a worker
//! - `upstream`: Outbound forwarding to an upstream
//! - `node`: The worker process event loop
//! - `pool`: Spawning workers and wiring their channels
//! - `dispatch`: Per-request dispatch on the master
//! - `server`: HTTP listener of the master
//! - `logging`: Logging system initialization

pub mod config;
pub mod dispatch;
pub mod error;
pub mod load_balancer;
pub mod logging;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod server;
pub mod upstream;
pub mod utils;
pub mod worker;
