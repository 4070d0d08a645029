use std::net::SocketAddr;

use anyhow::Result;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use tokio::net::TcpListener;
use tracing::debug;

use crate::dispatch::Dispatcher;

/// Client-facing HTTP server of the master process.
///
/// Every accepted connection is served on its own task; each request on it
/// goes through the [`Dispatcher`].
pub struct Server {
    /// The TCP listener for accepting incoming connections
    connection: TcpListener,
    dispatcher: Dispatcher,
}

impl Server {
    /// Creates a new server instance bound to the specified address.
    ///
    /// # Arguments
    ///
    /// * `addr` - The network address to bind to
    /// * `dispatcher` - Hands each request to a worker
    pub async fn new(addr: SocketAddr, dispatcher: Dispatcher) -> Result<Self> {
        Ok(Self {
            connection: TcpListener::bind(&addr).await?,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.connection.local_addr()?)
    }

    /// Accepts a new connection and spawns a task to handle it.
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` when a connection is successfully accepted,
    /// or an error if accepting fails.
    pub async fn accept(&self) -> Result<()> {
        let (conn, address) = self.connection.accept().await?;
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(req, address).await }
            });

            let result = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(conn), service)
                .await;
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", address, e);
            }
        });
        Ok(())
    }
}
