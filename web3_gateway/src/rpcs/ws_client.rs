//! WebSocket upstream transport.
//!
//! One long-lived connection per endpoint. A background reader demultiplexes
//! server frames to waiting sessions keyed by a digest of the batch's sorted
//! ids; writes share the sink behind an async mutex. The reader exiting
//! tears down every pending session and attempts one reconnect.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, warn};

use crate::digest::short;
use crate::errors::{GatewayError, GatewayResult};
use crate::jsonrpc::{parse_upstream, SealedRequest, UpstreamResponse};
use crate::jsonrpc_schema::JsonRpcSchema;
use crate::rpcs::dispatcher::UpstreamClient;
use crate::rpcs::endpoint::Endpoint;
use crate::rpcs::{note_block_numbers, record_error_result, validate_results};
use crate::stats::ResponseProfile;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

fn request_session_key(data: &[SealedRequest]) -> String {
    let mut ids: Vec<&str> = data.iter().map(|d| d.id.as_str()).collect();
    ids.sort_unstable();
    short(&ids.concat())
}

fn response_session_key(results: &[UpstreamResponse]) -> String {
    let mut ids: Vec<String> = results.iter().map(|r| r.correlation_id()).collect();
    ids.sort_unstable();
    short(&ids.concat())
}

struct WsShared {
    endpoint: Arc<Endpoint>,
    sessions: DashMap<String, oneshot::Sender<Vec<UpstreamResponse>>>,
    sink: Mutex<Option<WsSink>>,
    closed: AtomicBool,
}

pub struct WsUpstream {
    shared: Arc<WsShared>,
    schema: Option<Arc<JsonRpcSchema>>,
}

impl WsUpstream {
    pub async fn connect(
        endpoint: Arc<Endpoint>,
        schema: Option<Arc<JsonRpcSchema>>,
    ) -> GatewayResult<Self> {
        let shared = Arc::new(WsShared {
            endpoint,
            sessions: DashMap::new(),
            sink: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        WsShared::establish(&shared, CONNECT_TIMEOUT).await?;

        Ok(Self { shared, schema })
    }
}

impl WsShared {
    async fn establish(shared: &Arc<Self>, timeout: Duration) -> GatewayResult<()> {
        let mut request = shared
            .endpoint
            .url()
            .as_str()
            .into_client_request()
            .map_err(|_| GatewayError::Upstream("Error connection to endpoint".into()))?;
        for (name, value) in shared.endpoint.headers() {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(name.as_bytes()),
                http::header::HeaderValue::from_str(&value),
            ) {
                request.headers_mut().insert(name, value);
            }
        }

        let started = Instant::now();
        match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => {
                let duration = started.elapsed().as_millis() as f64;
                shared.endpoint.note_connect(Some(duration.max(1.0)), true);

                let (sink, source) = stream.split();
                *shared.sink.lock().await = Some(sink);

                // boxed so the reader task (which re-enters establish on
                // close) doesn't recursively embed this future's type
                let reader: Pin<Box<dyn Future<Output = ()> + Send>> =
                    Box::pin(Self::background(shared.clone(), source));
                tokio::spawn(reader);

                Ok(())
            }
            Ok(Err(err)) => {
                error!(?err, endpoint = %shared.endpoint, "error creating connection");
                shared.endpoint.note_connect(None, false);
                Err(GatewayError::Upstream("Error connection to endpoint".into()))
            }
            Err(_) => {
                shared.endpoint.note_connect(None, false);
                Err(GatewayError::Upstream("Error connection to endpoint".into()))
            }
        }
    }

    /// Resident reader. Routes frames to their sessions; a lone error frame
    /// with no matching session fails the first waiter so a rejected batch
    /// surfaces somewhere.
    async fn background(shared: Arc<Self>, mut source: WsSource) {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let Ok((results, is_batch)) = parse_upstream(text.as_bytes()) else {
                        warn!(endpoint = %shared.endpoint, "failed to unmarshal message");
                        continue;
                    };
                    if results.is_empty() {
                        continue;
                    }

                    let key = response_session_key(&results);
                    if let Some((_, tx)) = shared.sessions.remove(&key) {
                        let _ = tx.send(results);
                        continue;
                    }

                    if !is_batch && results.len() == 1 && results[0].is_error() {
                        let first = shared.sessions.iter().next().map(|e| e.key().clone());
                        if let Some(first) = first {
                            if let Some((_, tx)) = shared.sessions.remove(&first) {
                                let _ = tx.send(results);
                            }
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    warn!(?frame, endpoint = %shared.endpoint, "connection closed");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(?err, endpoint = %shared.endpoint, "error reading message");
                    break;
                }
            }
        }

        // the connection is gone. waiters see their channel close and turn
        // that into a connection error
        shared.endpoint.set_health(false);
        shared.sessions.clear();
        *shared.sink.lock().await = None;

        if !shared.closed.load(Ordering::Relaxed) {
            // TODO: back off and retry instead of giving up after one attempt
            if let Err(err) = Self::establish(&shared, CONNECT_TIMEOUT).await {
                warn!(%err, endpoint = %shared.endpoint, "reconnect failed");
            }
        }
    }

    async fn send(&self, text: String) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut sink = self.sink.lock().await;

        match sink.as_mut() {
            Some(sink) => sink.send(Message::Text(text)).await,
            None => Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed),
        }
    }
}

/// Removes the session entry when the caller goes away, so cancelled waits
/// don't leak senders.
struct SessionGuard<'a> {
    sessions: &'a DashMap<String, oneshot::Sender<Vec<UpstreamResponse>>>,
    key: &'a str,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(self.key);
    }
}

impl WsUpstream {
    async fn call_inner(
        &self,
        data: &[SealedRequest],
        profile: &mut ResponseProfile,
    ) -> GatewayResult<Vec<UpstreamResponse>> {
        let body = serde_json::to_string(data)
            .map_err(|_| GatewayError::Internal("Marshalling request failed".into()))?;

        let key = request_session_key(data);
        let (tx, rx) = oneshot::channel();
        self.shared.sessions.insert(key.clone(), tx);
        let _session = SessionGuard {
            sessions: &self.shared.sessions,
            key: &key,
        };

        let _inflight = self.shared.endpoint.inflight_guard();
        let started = Instant::now();

        if let Err(err) = self.shared.send(body).await {
            warn!(?err, endpoint = %self.shared.endpoint, "error creating request");
            profile.duration = started.elapsed().as_millis() as i64;
            profile.code = Some("request_error".to_string());
            profile.error = Some(err.to_string());

            // a broken pipe usually means the server went away between
            // frames; try to bring the connection back for the next attempt
            if !self.shared.closed.load(Ordering::Relaxed) {
                let _ = WsShared::establish(&self.shared, WRITE_RECONNECT_TIMEOUT).await;
            }

            return Err(GatewayError::Upstream("Error creating request".into()));
        }

        let mut results = match rx.await {
            Ok(results) => results,
            Err(_) => {
                profile.duration = started.elapsed().as_millis() as i64;
                profile.code = Some("connection_error".to_string());
                return Err(GatewayError::Upstream("Error connection to endpoint".into()));
            }
        };

        profile.duration = started.elapsed().as_millis() as i64;
        profile.status = 200;
        profile.traffic = serde_json::to_vec(&results).map(|b| b.len()).unwrap_or(0);

        if let Some(last) = results.last() {
            if last.is_error() {
                record_error_result(profile, last);
                return Ok(results);
            }
        }

        if results.len() != data.len() {
            return Ok(results);
        }

        note_block_numbers(&self.shared.endpoint, data, &results);

        if let Some(schema) = &self.schema {
            validate_results(schema, profile, data, &mut results)?;
        }

        Ok(results)
    }
}

#[async_trait]
impl UpstreamClient for WsUpstream {
    async fn call(
        &self,
        data: &[SealedRequest],
        profile: &mut ResponseProfile,
    ) -> GatewayResult<Vec<UpstreamResponse>> {
        let out = self.call_inner(data, profile).await;

        self.shared.endpoint.note_request(profile);

        out
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Some(mut sink) = shared.sink.lock().await.take() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        });
    }
}
