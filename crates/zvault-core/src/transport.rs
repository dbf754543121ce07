//! Cluster listeners and request forwarding.
//!
//! While a node is active it serves the cluster port: mutual TLS 1.2 with
//! the cluster certificate, ALPN `h2`, and a small HTTP/2 API that executes
//! forwarded logical requests against the local barrier. Standbys dial that
//! port with the same certificate and replay client requests verbatim.
//!
//! The core never opens sockets on its own; the host supplies them through
//! a [`ListenerProvider`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use rustls::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::barrier::Barrier;
use crate::error::{ForwardError, ListenerError, LogicalError};
use crate::logical::{LogicalHandler, Request, Response};

/// Path of the forwarding endpoint on the cluster port.
pub const FORWARD_PATH: &str = "/v1/cluster/forward";

/// Path of the liveness endpoint on the cluster port.
pub const PING_PATH: &str = "/v1/cluster/ping";

/// Handshaken connections waiting for the HTTP server, per listener.
const ACCEPT_BACKLOG: usize = 64;

/// Sockets and optional extra routes handed over by the host.
#[derive(Debug, Default)]
pub struct ClusterListeners {
    pub listeners: Vec<TcpListener>,
    /// Merged into the cluster router when present.
    pub handler: Option<Router>,
}

/// Produces cluster listeners each time a node becomes active.
#[async_trait]
pub trait ListenerProvider: Send + Sync + 'static {
    /// Bind a fresh set of cluster listeners.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] if no usable listener can be produced.
    async fn cluster_listeners(&self) -> Result<ClusterListeners, ListenerError>;
}

/// Binds each API address's IP at the port one above it.
#[derive(Debug, Clone)]
pub struct PortOffsetListenerProvider {
    api_addrs: Vec<SocketAddr>,
}

impl PortOffsetListenerProvider {
    #[must_use]
    pub fn new(api_addrs: Vec<SocketAddr>) -> Self {
        Self { api_addrs }
    }

    /// The addresses this provider binds.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Derive`] for an API address on port 65535.
    pub fn cluster_addrs(&self) -> Result<Vec<SocketAddr>, ListenerError> {
        self.api_addrs
            .iter()
            .map(|addr| {
                let port = addr.port().checked_add(1).ok_or_else(|| ListenerError::Derive {
                    addr: addr.to_string(),
                    reason: "port + 1 overflows".to_owned(),
                })?;
                Ok(SocketAddr::new(addr.ip(), port))
            })
            .collect()
    }
}

#[async_trait]
impl ListenerProvider for PortOffsetListenerProvider {
    async fn cluster_listeners(&self) -> Result<ClusterListeners, ListenerError> {
        let addrs = self.cluster_addrs()?;
        if addrs.is_empty() {
            return Err(ListenerError::Empty);
        }

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| ListenerError::Bind {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
            listeners.push(listener);
        }
        Ok(ClusterListeners {
            listeners,
            handler: None,
        })
    }
}

/// Outcome of a forwarded request, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForwardReply {
    Ok { response: Response },
    Err { error: LogicalError },
}

#[derive(Clone)]
struct ClusterState {
    barrier: Arc<Barrier>,
    handler: Arc<dyn LogicalHandler>,
    term: CancellationToken,
}

/// Build the cluster-port router.
///
/// Requests arriving after `term` is cancelled are refused with
/// [`LogicalError::NotActive`].
pub fn cluster_router(
    barrier: Arc<Barrier>,
    handler: Arc<dyn LogicalHandler>,
    term: CancellationToken,
) -> Router {
    Router::new()
        .route(FORWARD_PATH, post(forward_handler))
        .route(PING_PATH, get(ping_handler))
        .with_state(ClusterState {
            barrier,
            handler,
            term,
        })
}

async fn forward_handler(
    State(state): State<ClusterState>,
    Json(request): Json<Request>,
) -> Json<ForwardReply> {
    if state.term.is_cancelled() {
        return Json(ForwardReply::Err {
            error: LogicalError::NotActive,
        });
    }
    debug!(operation = %request.operation, path = %request.path, "executing forwarded request");
    let reply = match state.handler.handle(&state.barrier, &request).await {
        Ok(response) => ForwardReply::Ok { response },
        Err(error) => ForwardReply::Err { error },
    };
    Json(reply)
}

async fn ping_handler(State(state): State<ClusterState>) -> HttpResponse {
    if state.term.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    }
}

/// Handshaken TLS connections fed to `axum::serve`.
struct TlsListener {
    rx: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl Future<Output = (Self::Io, Self::Addr)> + Send {
        async {
            match self.rx.recv().await {
                Some(conn) => conn,
                // The accept loop is gone; wait for graceful shutdown.
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Running cluster listeners of one active term.
#[derive(Debug)]
pub struct ClusterListenerSet {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl ClusterListenerSet {
    /// Start serving `listeners` with `tls`.
    ///
    /// Cancelling `term` closes the sockets.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Empty`] when there is nothing to serve, or
    /// [`ListenerError::Bind`] if a socket has no local address.
    pub fn start(
        listeners: ClusterListeners,
        tls: Arc<ServerConfig>,
        router: Router,
        term: &CancellationToken,
        handshake_timeout: Duration,
    ) -> Result<Self, ListenerError> {
        if listeners.listeners.is_empty() {
            return Err(ListenerError::Empty);
        }

        let router = match listeners.handler {
            Some(extra) => router.merge(extra),
            None => router,
        };
        let cancel = term.child_token();
        let acceptor = TlsAcceptor::from(tls);
        let mut tasks = Vec::with_capacity(listeners.listeners.len() * 2);
        let mut local_addrs = Vec::with_capacity(listeners.listeners.len());

        for listener in listeners.listeners {
            let local_addr = listener.local_addr().map_err(|e| ListenerError::Bind {
                addr: "<unknown>".to_owned(),
                reason: e.to_string(),
            })?;
            let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

            tasks.push(tokio::spawn(accept_loop(
                listener,
                acceptor.clone(),
                tx,
                cancel.clone(),
                handshake_timeout,
            )));

            let server = axum::serve(TlsListener { rx, local_addr }, router.clone())
                .with_graceful_shutdown(cancel.clone().cancelled_owned());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.await {
                    warn!(%local_addr, error = %e, "cluster server exited with error");
                }
            }));

            info!(%local_addr, "cluster listener started");
            local_addrs.push(local_addr);
        }

        Ok(Self {
            cancel,
            tasks,
            local_addrs,
        })
    }

    /// Addresses actually bound.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting at once, then wait up to `grace` for in-flight work.
    /// Tasks still running after that are aborted.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        debug!(listeners = self.local_addrs.len(), "cluster listeners closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
    cancel: CancellationToken,
    handshake_timeout: Duration,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let acceptor = acceptor.clone();
                    let tx = tx.clone();
                    handshakes.spawn(async move {
                        match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                            Ok(Ok(stream)) => {
                                if tx.send((stream, peer)).await.is_err() {
                                    debug!(%peer, "cluster server gone, dropping connection");
                                }
                            }
                            Ok(Err(e)) => debug!(%peer, error = %e, "cluster TLS handshake failed"),
                            Err(_) => debug!(%peer, "cluster TLS handshake timed out"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "cluster accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
    handshakes.abort_all();
    drop(listener);
}

/// HTTP/2 client for one active node.
#[derive(Debug, Clone)]
pub struct ForwardingClient {
    addr: String,
    url: String,
    client: reqwest::Client,
}

impl ForwardingClient {
    /// Build a client for the cluster listener at `cluster_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        cluster_addr: &str,
        tls: &ClientConfig,
        timeout: Duration,
    ) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls.clone())
            .http2_prior_knowledge()
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::Transport {
                addr: cluster_addr.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            addr: cluster_addr.to_owned(),
            url: format!("https://{cluster_addr}{FORWARD_PATH}"),
            client,
        })
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Replay `request` on the active node.
    ///
    /// # Errors
    ///
    /// - [`ForwardError::Transport`] on connect, handshake, or timeout failure.
    /// - [`ForwardError::Protocol`] if the reply is not a forwarding reply.
    /// - [`ForwardError::Remote`] with the active node's own error.
    pub async fn forward(&self, request: &Request) -> Result<Response, ForwardError> {
        let reply = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| ForwardError::Transport {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;

        let status = reply.status();
        if !status.is_success() {
            return Err(ForwardError::Protocol {
                addr: self.addr.clone(),
                reason: format!("unexpected HTTP status {status}"),
            });
        }

        let reply: ForwardReply = reply.json().await.map_err(|e| ForwardError::Protocol {
            addr: self.addr.clone(),
            reason: e.to_string(),
        })?;
        match reply {
            ForwardReply::Ok { response } => Ok(response),
            ForwardReply::Err { error } => Err(ForwardError::Remote(error)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use zvault_storage::MemoryBackend;

    use super::*;
    use crate::cluster::{ClusterIdentity, ClusterInfo, ClusterKeyParams};
    use crate::crypto::EncryptionKey;
    use crate::logical::{Operation, PassthroughBackend};

    async fn unsealed_barrier() -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        let master = EncryptionKey::generate();
        barrier.initialize(&master).await.unwrap();
        barrier.unseal(&master).await.unwrap();
        barrier
    }

    fn new_identity() -> (ClusterIdentity, ClusterKeyParams, ClusterInfo) {
        let info = ClusterInfo {
            name: "transport-test".to_owned(),
            id: uuid::Uuid::new_v4().to_string(),
        };
        let params = ClusterKeyParams::generate().unwrap();
        (ClusterIdentity::issue(&info, &params).unwrap(), params, info)
    }

    async fn serve(
        identity: &ClusterIdentity,
        barrier: Arc<Barrier>,
        term: &CancellationToken,
    ) -> ClusterListenerSet {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = cluster_router(barrier, Arc::new(PassthroughBackend::default()), term.clone());
        ClusterListenerSet::start(
            ClusterListeners {
                listeners: vec![listener],
                handler: None,
            },
            identity.server_config().unwrap(),
            router,
            term,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn port_offset_derivation() {
        let provider = PortOffsetListenerProvider::new(vec![
            "127.0.0.1:8200".parse().unwrap(),
            "[::1]:9000".parse().unwrap(),
        ]);
        let addrs = provider.cluster_addrs().unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8201".parse().unwrap());
        assert_eq!(addrs[1], "[::1]:9001".parse().unwrap());

        let overflow = PortOffsetListenerProvider::new(vec!["127.0.0.1:65535".parse().unwrap()]);
        assert!(matches!(overflow.cluster_addrs(), Err(ListenerError::Derive { .. })));
    }

    #[tokio::test]
    async fn empty_provider_output_is_rejected() {
        let (identity, _, _) = new_identity();
        let barrier = unsealed_barrier().await;
        let term = CancellationToken::new();
        let router = cluster_router(barrier, Arc::new(PassthroughBackend::default()), term.clone());
        let err = ClusterListenerSet::start(
            ClusterListeners::default(),
            identity.server_config().unwrap(),
            router,
            &term,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ListenerError::Empty));
    }

    #[tokio::test]
    async fn forwarded_request_executes_on_serving_node() {
        let (identity, params, info) = new_identity();
        let barrier = unsealed_barrier().await;
        let term = CancellationToken::new();
        let set = serve(&identity, Arc::clone(&barrier), &term).await;
        let addr = set.local_addrs()[0].to_string();

        let standby = ClusterIdentity::inherit(info, &params, identity.certificate().clone()).unwrap();
        let client = ForwardingClient::new(
            &addr,
            &standby.client_config().unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        let mut data = BTreeMap::new();
        data.insert("value".to_owned(), json!("forwarded"));
        client
            .forward(&Request::new(Operation::Update, "secret/fw").with_data(data))
            .await
            .unwrap();

        let direct = PassthroughBackend::default()
            .handle(&barrier, &Request::new(Operation::Read, "secret/fw"))
            .await
            .unwrap();
        let remote = client
            .forward(&Request::new(Operation::Read, "secret/fw"))
            .await
            .unwrap();
        assert_eq!(direct, remote);

        let err = client
            .forward(&Request::new(Operation::Create, "secret/empty"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Remote(LogicalError::InvalidRequest { .. })));

        set.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn request_reaching_an_ended_term_is_refused() {
        let barrier = unsealed_barrier().await;
        let term = CancellationToken::new();
        let state = ClusterState {
            barrier,
            handler: Arc::new(PassthroughBackend::default()),
            term: term.clone(),
        };

        let Json(reply) = forward_handler(
            State(state.clone()),
            Json(Request::new(Operation::Read, "secret/x")),
        )
        .await;
        assert!(matches!(reply, ForwardReply::Ok { .. }));

        term.cancel();
        let Json(reply) =
            forward_handler(State(state), Json(Request::new(Operation::Read, "secret/x"))).await;
        assert_eq!(
            reply,
            ForwardReply::Err {
                error: LogicalError::NotActive
            }
        );

        let err = crate::error::CoreError::from(ForwardError::Remote(LogicalError::NotActive));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_with_foreign_certificate_is_refused() {
        let (identity, _, _) = new_identity();
        let barrier = unsealed_barrier().await;
        let term = CancellationToken::new();
        let set = serve(&identity, barrier, &term).await;
        let addr = set.local_addrs()[0].to_string();

        let (stranger, _, _) = new_identity();
        let client = ForwardingClient::new(
            &addr,
            &stranger.client_config().unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = client
            .forward(&Request::new(Operation::Read, "secret/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Transport { .. }));

        set.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_socket() {
        let (identity, _, _) = new_identity();
        let barrier = unsealed_barrier().await;
        let term = CancellationToken::new();
        let set = serve(&identity, barrier, &term).await;
        let addr = set.local_addrs()[0];

        set.shutdown(Duration::from_secs(1)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
