//! Per-request dispatch on the master: select a worker, send, await, respond.

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::Config,
    error::{DispatchError, LoadBalancerError},
    load_balancer::{LoadBalancer, Policy},
    pool::{Inbound, InboundReceiver},
    protocol::{ForwardRequest, INTERNAL_SERVER_ERROR, WorkerReply},
    worker::Completion,
};

pub const WORKER_ID_HEADER: &str = "x-worker-id";

pub type ResponseBody = Full<Bytes>;

/// Turns inbound HTTP requests into worker exchanges.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    load_balancer: Arc<LoadBalancer>,
    policy: Policy,
    reply_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        load_balancer: Arc<LoadBalancer>,
        policy: Policy,
        reply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            load_balancer,
            policy,
            reply_timeout,
        }
    }

    pub fn from_config(load_balancer: Arc<LoadBalancer>, config: &Config) -> Self {
        Self::new(
            load_balancer,
            Policy::from_tag(&config.server.algorithm),
            config.server.request_timeout_ms.map(Duration::from_millis),
        )
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    /// Handles one inbound request. The request body is never read.
    ///
    /// # Returns
    ///
    /// The response to write, or [`DispatchError::Aborted`] when the worker
    /// closed the exchange without a reply and the connection should be dropped.
    #[instrument(skip_all, fields(remote = %remote, path = %req.uri()))]
    pub async fn dispatch<B>(
        &self,
        req: Request<B>,
        remote: SocketAddr,
    ) -> Result<Response<ResponseBody>, DispatchError> {
        let client = client_address(remote.ip());
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let request = ForwardRequest::http(path, collect_headers(req.headers()));

        let worker = match self.load_balancer.select(self.policy, Some(client.as_str())) {
            Ok(worker) => worker,
            Err(LoadBalancerError::NoWorkersAvailable) => {
                error!("No workers available");
                return Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_SERVER_ERROR,
                ));
            }
        };
        let id = worker.id();

        let slot = match worker.send(&request) {
            Ok(slot) => slot,
            Err(e) => {
                // Nothing was sent, so no closed signal will release the slot.
                error!("Failed to dispatch to worker {}: {}", id, e);
                self.load_balancer.release(id);
                return Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_SERVER_ERROR,
                ));
            }
        };
        debug!("Dispatched to worker {}", id);

        let completion = match self.reply_timeout {
            Some(limit) => match tokio::time::timeout(limit, slot).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("Worker {} did not reply within {:?}", id, limit);
                    return Ok(text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"));
                }
            },
            None => slot.await,
        };

        match completion {
            Ok(Completion::Reply(WorkerReply::Data(data))) => {
                let mut response = Response::new(Full::new(Bytes::from(data)));
                if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
                    response.headers_mut().insert(WORKER_ID_HEADER, value);
                }
                Ok(response)
            }
            Ok(Completion::Reply(WorkerReply::Error { code, message })) => {
                debug!("Worker {} answered {}", id, code.status());
                Ok(text_response(code.status(), message))
            }
            Ok(Completion::Malformed(reason)) => {
                error!("Worker {} sent a malformed reply: {}", id, reason);
                Ok(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_SERVER_ERROR,
                ))
            }
            Ok(Completion::Aborted) | Err(_) => {
                info!("Worker {} closed the request without replying", id);
                Err(DispatchError::Aborted(id))
            }
        }
    }
}

/// Feeds every worker line to its handle, then to the load balancer's accounting.
pub async fn route_inbound(mut inbound: InboundReceiver, load_balancer: Arc<LoadBalancer>) {
    while let Some(message) = inbound.recv().await {
        match message {
            Inbound::Line(id, line) => {
                match load_balancer.handle(id) {
                    Some(handle) => handle.deliver(&line),
                    None => warn!("Message from unknown worker {}", id),
                }
                load_balancer.on_worker_message(id, &line);
            }
            Inbound::Closed(id) => {
                error!("Worker {} is gone, failing its pending requests", id);
                if let Some(handle) = load_balancer.handle(id) {
                    // No closed signal will come for these.
                    for _ in 0..handle.abort_pending() {
                        load_balancer.release(id);
                    }
                }
            }
        }
    }
    debug!("Inbound router stopped");
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
}

/// IPv4-mapped IPv6 peers are reported in dotted-decimal form.
fn client_address(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.to_string())
            .unwrap_or_else(|| v6.to_string()),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Repeated headers are joined with ", ".
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        match collected.get_mut(name.as_str()) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => {
                collected.insert(name.as_str().to_string(), value.into_owned());
            }
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use http_body_util::BodyExt as _;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        protocol::decode_request,
        worker::{WorkerHandle, WorkerId},
    };

    fn remote() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 5], 40000))
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    /// One worker whose outbound lines the test reads directly.
    fn single_worker(
        timeout: Option<Duration>,
    ) -> (Dispatcher, Arc<WorkerHandle>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(WorkerHandle::new(WorkerId(1), tx));
        let lb = Arc::new(LoadBalancer::new(vec![handle.clone()]));
        (Dispatcher::new(lb, Policy::RoundRobin, timeout), handle, rx)
    }

    async fn body_of(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn maps_v4_in_v6_clients() {
        let mapped = Ipv4Addr::new(10, 0, 0, 5).to_ipv6_mapped();
        assert_eq!(client_address(IpAddr::V6(mapped)), "10.0.0.5");
        assert_eq!(client_address(IpAddr::V6(Ipv6Addr::LOCALHOST)), "::1");
    }

    #[test]
    fn joins_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("host", HeaderValue::from_static("localhost:3000"));

        let collected = collect_headers(&headers);
        assert_eq!(collected["accept"], "text/html, application/json");
        assert_eq!(collected["host"], "localhost:3000");
    }

    #[tokio::test]
    async fn empty_pool_answers_500() {
        let lb = Arc::new(LoadBalancer::new(vec![]));
        let dispatcher = Dispatcher::new(lb, Policy::Random, None);

        let response = dispatcher.dispatch(request("/a"), remote()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn success_sets_worker_header() {
        let (dispatcher, handle, mut rx) = single_worker(None);

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/todos?x=1"), remote()).await }
        });

        let line = rx.recv().await.unwrap();
        assert_eq!(decode_request(&line).unwrap().path, "/todos?x=1");
        handle.deliver(r#"{"data":"[1,2,3]"}"#);

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[WORKER_ID_HEADER], "1");
        assert_eq!(body_of(response).await, "[1,2,3]");
    }

    #[tokio::test]
    async fn error_reply_sets_status_and_body() {
        let (dispatcher, handle, mut rx) = single_worker(None);

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/nope"), remote()).await }
        });

        rx.recv().await.unwrap();
        handle.deliver(r#"{"errorCode":"404","errorMessage":"Rule not found for path /nope"}"#);

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(WORKER_ID_HEADER).is_none());
        assert_eq!(body_of(response).await, "Rule not found for path /nope");
    }

    #[tokio::test]
    async fn malformed_reply_is_500() {
        let (dispatcher, handle, mut rx) = single_worker(None);

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/a"), remote()).await }
        });

        rx.recv().await.unwrap();
        handle.deliver(r#"{"data":"x","errorCode":"500","errorMessage":"y"}"#);

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_of(response).await, INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn bare_closed_signal_aborts() {
        let (dispatcher, handle, mut rx) = single_worker(None);

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/a"), remote()).await }
        });

        rx.recv().await.unwrap();
        handle.deliver(r#"{"connectionClosed":true}"#);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Aborted(WorkerId(1))));
    }

    #[tokio::test]
    async fn timeout_answers_504_and_keeps_slot_until_closed() {
        let (dispatcher, handle, mut rx) = single_worker(Some(Duration::from_millis(50)));
        let lb = dispatcher.load_balancer().clone();

        let response = dispatcher.dispatch(request("/slow"), remote()).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(lb.stats(WorkerId(1)).unwrap().active_connections, 1);

        rx.recv().await.unwrap();
        for line in [r#"{"data":"late"}"#, r#"{"connectionClosed":true}"#] {
            handle.deliver(line);
            lb.on_worker_message(WorkerId(1), line);
        }
        assert_eq!(lb.stats(WorkerId(1)).unwrap().active_connections, 0);
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_releases_reservation() {
        let (dispatcher, _handle, rx) = single_worker(None);
        drop(rx);

        let response = dispatcher.dispatch(request("/a"), remote()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            dispatcher
                .load_balancer()
                .stats(WorkerId(1))
                .unwrap()
                .active_connections,
            0
        );
    }

    #[tokio::test]
    async fn router_delivers_and_releases() {
        let (dispatcher, _handle, mut rx) = single_worker(None);
        let lb = dispatcher.load_balancer().clone();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(route_inbound(inbound_rx, lb.clone()));

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/a"), remote()).await }
        });

        rx.recv().await.unwrap();
        inbound_tx
            .send(Inbound::Line(WorkerId(1), r#"{"data":"ok"}"#.into()))
            .unwrap();
        inbound_tx
            .send(Inbound::Line(WorkerId(1), r#"{"connectionClosed":true}"#.into()))
            .unwrap();

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Let the router drain the closed signal.
        while lb.stats(WorkerId(1)).unwrap().active_connections != 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn router_aborts_pending_when_worker_dies() {
        let (dispatcher, _handle, mut rx) = single_worker(None);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(route_inbound(inbound_rx, dispatcher.load_balancer().clone()));

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/a"), remote()).await }
        });

        rx.recv().await.unwrap();
        inbound_tx.send(Inbound::Closed(WorkerId(1))).unwrap();

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn dead_worker_fails_fast_and_frees_its_slots() {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (master_side, worker_side) = tokio::io::duplex(4096);
        let (master_read, master_write) = tokio::io::split(master_side);
        let handle = crate::pool::attach(WorkerId(1), master_read, master_write, inbound_tx);
        let lb = Arc::new(LoadBalancer::new(vec![handle.clone()]));
        tokio::spawn(route_inbound(inbound_rx, lb.clone()));
        let dispatcher = Dispatcher::new(lb.clone(), Policy::RoundRobin, None);

        // One request in flight when the worker goes away.
        let in_flight = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(request("/a"), remote()).await }
        });
        while handle.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(worker_side);

        assert!(in_flight.await.unwrap().is_err());
        while lb.stats(WorkerId(1)).unwrap().active_connections != 0 {
            tokio::task::yield_now().await;
        }
        assert!(handle.is_closed());

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.dispatch(request("/b"), remote()),
        )
        .await
        .expect("request to a dead worker must not hang")
        .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(handle.pending_count(), 0);
        assert_eq!(lb.stats(WorkerId(1)).unwrap().active_connections, 0);
    }
}
