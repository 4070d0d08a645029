//! Outbound forwarding of a routed request to its upstream.

use std::{collections::BTreeMap, time::Duration};

use http::{HeaderName, HeaderValue, Method, Request, Uri, header};
use http_body_util::{BodyExt as _, Empty};
use hyper::{body::Bytes, client::conn::http1::Builder};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::{config::Upstream, error::ForwardError, utils::combine_uris};

/// Issues one GET per routed request and buffers the whole response body.
///
/// There are no retries: one attempt per inbound request, bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct Forwarder {
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Forwards `path` to `upstream` with the inbound headers.
    ///
    /// # Returns
    ///
    /// The response body decoded as UTF-8 (lossily). Any connection-level
    /// failure, including the timeout, is a [`ForwardError`].
    pub async fn forward(
        &self,
        upstream: &Upstream,
        path: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, ForwardError> {
        match tokio::time::timeout(self.timeout, forward_once(upstream, path, headers)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Upstream {} timed out after {:?}", upstream.id, self.timeout);
                Err(ForwardError::Timeout(self.timeout))
            }
        }
    }
}

async fn forward_once(
    upstream: &Upstream,
    path: &str,
    headers: &BTreeMap<String, String>,
) -> Result<String, ForwardError> {
    let base = upstream
        .url
        .parse::<Uri>()
        .map_err(|e| ForwardError::InvalidUri(format!("{}: {}", upstream.url, e)))?;
    let target = path
        .parse::<Uri>()
        .map_err(|e| ForwardError::InvalidUri(format!("{}: {}", path, e)))?;
    let uri = combine_uris(&base, &target)?;

    let host = uri
        .host()
        .ok_or_else(|| ForwardError::InvalidUri(format!("{} has no host", upstream.url)))?;
    let port = uri.port_u16().unwrap_or(80);
    let address = format!("{}:{}", host, port);

    debug!("Connecting to upstream {} at {}", upstream.id, address);
    let stream = TcpStream::connect((connect_host(host), port))
        .await
        .map_err(|source| ForwardError::Connect {
            address: address.clone(),
            source,
        })?;

    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(ForwardError::Handshake)?;

    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Upstream connection closed with error: {}", err);
        }
    });

    let request_target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(request_target)
        .body(Empty::<Bytes>::new())?;
    copy_headers(headers, request.headers_mut());
    if !request.headers().contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&address) {
            request.headers_mut().insert(header::HOST, value);
        }
    }

    debug!("Sending GET {} to upstream {}", request_target, upstream.id);
    let response = sender
        .send_request(request)
        .await
        .map_err(ForwardError::Request)?;
    debug!("Upstream {} answered {}", upstream.id, response.status());

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(ForwardError::Body)?
        .to_bytes();

    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// IPv6 literals come out of a URI bracketed, which the resolver rejects.
fn connect_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Copies inbound headers onto the outbound request.
///
/// Body framing headers are dropped since the request body is not forwarded.
fn copy_headers(headers: &BTreeMap<String, String>, target: &mut http::HeaderMap) {
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!("Skipping unforwardable header {}", name);
            continue;
        };
        if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
            continue;
        }
        target.insert(name, value);
    }
}
