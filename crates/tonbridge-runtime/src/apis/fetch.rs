//! HTTP fetch polyfill backed by `reqwest`.
//!
//! Guest code calls `fetch(url, options)` and receives a promise for a plain
//! response record. Transfers run on the shared runtime; the response body
//! is read as a stream under a configured size bound, and the result is
//! carried back as JSON through the reactor.
//!
//! Cancellation is keyed by a caller-chosen abort id: the guest passes
//! `abortId` in the options and may later call `abortRequest(id)`. An
//! aborted transfer settles with a dedicated abort error, never disguised as
//! a network failure.

use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tonbridge_core::{GuestError, GuestValue, ScriptContext};
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};
use crate::marshal;
use crate::reactor::Reactor;
use crate::sync_cell::SyncCell;

/// Request options accepted from guest code.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// Credential-inclusion policy (`omit`, `same-origin`, `include`).
    /// `omit` drops cookie and authorization headers from the request.
    pub credentials: Option<String>,
    pub timeout_ms: Option<u64>,
    pub abort_id: Option<i32>,
}

/// Response record handed back to guest code.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

type AbortRegistry = Arc<SyncCell<HashMap<i32, oneshot::Sender<()>>>>;

/// Per-context fetch surface. The underlying `reqwest` client is cheap to
/// clone and shared across all transfers of the context.
pub struct FetchClient {
    http: reqwest::Client,
    aborts: AbortRegistry,
    max_body_bytes: usize,
}

impl FetchClient {
    pub fn new(http: reqwest::Client, max_body_bytes: usize) -> Rc<Self> {
        Rc::new(Self {
            http,
            aborts: Arc::new(SyncCell::default()),
            max_body_bytes,
        })
    }

    /// Signal the transfer registered under `id`. Returns whether a transfer
    /// was listening; a second abort for the same id is a no-op.
    pub fn abort(&self, id: i32) -> bool {
        let sender = self.aborts.with(|registry| registry.remove(&id));
        match sender {
            Some(sender) => {
                debug!(abort = id, "fetch abort requested");
                sender.send(()).is_ok()
            }
            None => false,
        }
    }

    /// Build the background transfer for one request. Everything captured is
    /// `Send`; the returned future runs off the context thread.
    pub fn transfer(
        &self,
        url: String,
        options: FetchOptions,
    ) -> impl Future<Output = HostResult<Json>> + Send + use<> {
        let abort_rx = options.abort_id.map(|id| {
            let (tx, rx) = oneshot::channel();
            let replaced = self.aborts.with(|registry| registry.insert(id, tx));
            if replaced.is_some() {
                warn!(abort = id, "abort id reused while a transfer was in flight");
            }
            (id, rx)
        });

        let http = self.http.clone();
        let registry = self.aborts.clone();
        let timeout = options.timeout_ms;
        let body_limit = self.max_body_bytes;

        async move {
            let request = perform(http, url, options, body_limit);
            let request = async move {
                match timeout {
                    Some(ms) => tokio::time::timeout(Duration::from_millis(ms), request)
                        .await
                        .map_err(|_| HostError::Timeout(ms))?,
                    None => request.await,
                }
            };

            match abort_rx {
                Some((id, rx)) => {
                    let result = run_with_abort(request, rx).await;
                    registry.with(|table| table.remove(&id));
                    result
                }
                None => request.await,
            }
        }
    }
}

/// Race a transfer against its abort signal. A dropped signal sender is not
/// an abort; the transfer keeps running.
async fn run_with_abort<F>(transfer: F, rx: oneshot::Receiver<()>) -> HostResult<Json>
where
    F: Future<Output = HostResult<Json>> + Send,
{
    tokio::pin!(transfer);
    tokio::select! {
        result = &mut transfer => result,
        signal = rx => match signal {
            Ok(()) => Err(HostError::Aborted),
            Err(_) => transfer.await,
        },
    }
}

async fn perform(
    http: reqwest::Client,
    url: String,
    options: FetchOptions,
    body_limit: usize,
) -> HostResult<Json> {
    let method = options.method.as_deref().unwrap_or("GET");
    let method = method
        .parse::<reqwest::Method>()
        .map_err(|_| HostError::http(format!("invalid method '{method}'")))?;

    let omit_credentials = options.credentials.as_deref() == Some("omit");
    let mut request = http.request(method, &url);
    for (name, value) in &options.headers {
        if omit_credentials
            && (name.eq_ignore_ascii_case("cookie") || name.eq_ignore_ascii_case("authorization"))
        {
            debug!(header = %name, "credential header omitted");
            continue;
        }
        request = request.header(name, value);
    }
    if let Some(body) = options.body {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| HostError::http(e.to_string()))?;

    let status = response.status();
    let final_url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = collect_body(response.bytes_stream(), body_limit).await?;

    let record = FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        url: final_url,
        headers,
        body,
    };
    serde_json::to_value(&record).map_err(|e| HostError::internal(e.to_string()))
}

/// Accumulate a body stream chunk by chunk, failing once `limit` bytes
/// would be exceeded instead of buffering an unbounded response.
async fn collect_body<S, B, E>(mut stream: S, limit: usize) -> HostResult<String>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HostError::http(e.to_string()))?;
        let chunk = chunk.as_ref();
        if body.len() + chunk.len() > limit {
            return Err(HostError::http(format!(
                "response body exceeds {limit} bytes"
            )));
        }
        body.extend_from_slice(chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Install `fetch` and `abortRequest` on the context.
pub fn install(ctx: &Rc<dyn ScriptContext>, reactor: Rc<Reactor>, client: Rc<FetchClient>) {
    let global = ctx.global();

    {
        let client = client.clone();
        let fetch = ctx.create_function(
            "fetch",
            Rc::new(move |args| {
                let url = match args.first().and_then(GuestValue::as_str) {
                    Some(url) => url.to_string(),
                    None => return Err(GuestError::type_error("fetch url must be a string")),
                };
                let options: FetchOptions =
                    marshal::decode_opt(args.get(1).unwrap_or(&GuestValue::Undefined))
                        .map_err(|e| GuestError::type_error(format!("fetch options: {e}")))?
                        .unwrap_or_default();

                debug!(url = %url, "fetch");
                reactor
                    .schedule_promise(client.transfer(url, options))
                    .map_err(|e| GuestError::runtime(e.to_string()))
            }),
        );
        global.set_member("fetch", GuestValue::Function(fetch));
    }

    {
        let abort = ctx.create_function(
            "abortRequest",
            Rc::new(move |args| {
                let delivered = match args.first().and_then(GuestValue::as_f64) {
                    Some(id) => client.abort(id as i32),
                    None => false,
                };
                Ok(GuestValue::Bool(delivered))
            }),
        );
        global.set_member("abortRequest", GuestValue::Function(abort));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn options_accept_guest_shape() {
        let options: FetchOptions = serde_json::from_value(json!({
            "method": "POST",
            "headers": {"content-type": "application/json"},
            "body": "{}",
            "credentials": "include",
            "timeoutMs": 5000,
            "abortId": 3
        }))
        .unwrap();
        assert_eq!(options.method.as_deref(), Some("POST"));
        assert_eq!(options.credentials.as_deref(), Some("include"));
        assert_eq!(options.timeout_ms, Some(5000));
        assert_eq!(options.abort_id, Some(3));

        let empty: FetchOptions = serde_json::from_value(json!({})).unwrap();
        assert!(empty.method.is_none());
        assert!(empty.headers.is_empty());
    }

    #[test]
    fn abort_signal_cancels_a_pending_transfer() {
        let rt = runtime();
        let (tx, rx) = oneshot::channel();

        let result = rt.block_on(run_with_abort(
            async {
                tx.send(()).ok();
                std::future::pending::<HostResult<Json>>().await
            },
            rx,
        ));
        assert!(matches!(result, Err(HostError::Aborted)));
    }

    #[test]
    fn dropped_abort_sender_does_not_cancel() {
        let rt = runtime();
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);

        let result = rt.block_on(run_with_abort(async { Ok(json!("done")) }, rx));
        assert_eq!(result.unwrap(), json!("done"));
    }

    #[test]
    fn abort_delivery_is_exactly_once_per_id() {
        let client = FetchClient::new(reqwest::Client::new(), 1 << 20);
        let (tx, mut rx) = oneshot::channel();
        client.aborts.with(|registry| {
            registry.insert(9, tx);
        });

        assert!(client.abort(9));
        assert!(rx.try_recv().is_ok());
        assert!(!client.abort(9));
        assert!(!client.abort(12));
    }

    #[test]
    fn body_collection_is_bounded() {
        let rt = runtime();

        let chunks =
            futures_util::stream::iter([Ok::<_, std::convert::Infallible>(b"hello".to_vec())]);
        assert_eq!(rt.block_on(collect_body(chunks, 1000)).unwrap(), "hello");

        let chunks = futures_util::stream::iter([
            Ok::<_, std::convert::Infallible>(vec![0u8; 600]),
            Ok(vec![0u8; 600]),
        ]);
        match rt.block_on(collect_body(chunks, 1000)) {
            Err(HostError::Http(message)) => assert!(message.contains("1000")),
            other => panic!("expected http error, got {:?}", other.err()),
        }
    }

    #[test]
    fn invalid_method_is_an_http_error() {
        let rt = runtime();
        let client = FetchClient::new(reqwest::Client::new(), 1 << 20);
        let result = rt.block_on(client.transfer(
            "http://localhost:1/".into(),
            FetchOptions {
                method: Some("NOT A METHOD".into()),
                ..Default::default()
            },
        ));
        match result {
            Err(HostError::Http(message)) => assert!(message.contains("invalid method")),
            other => panic!("expected http error, got {:?}", other.err()),
        }
    }
}
