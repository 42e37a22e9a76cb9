//! Upstream listener
//!
//! One public TCP listener per `(address, port)` endpoint a worker has
//! registered for. The listener owns the downstream registry for that
//! endpoint and drives two flows:
//!
//! - the accept loop: every public connection gets its own routing task
//! - routing: opaque TCP splice when no registered worker wants HTTP,
//!   request-level dispatch when any does, with TLS termination in front
//!   of either when workers supplied certificates
//!
//! The registry lock is only ever held to read a snapshot or apply a
//! mutation; all network I/O happens outside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::common::{splice, Stream};
use crate::config::{ACCEPT_RETRY_DELAY, ROUTE_POLL_INTERVAL};
use crate::mux::MuxStream;
use crate::protocol::http::{Request, Response};

use super::registry::{Downstream, Registry, RouteSnapshot};
use super::{is_transient_accept_error, Shared};

pub(crate) struct UpstreamListener {
    id: u64,
    address: String,
    port: u16,
    registry: RwLock<Registry>,
    missing_route_timeout: Duration,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UpstreamListener {
    pub fn new(id: u64, address: String, port: u16, missing_route_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            address,
            port,
            registry: RwLock::new(Registry::new()),
            missing_route_timeout,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn matches_endpoint(&self, address: &str, port: u16) -> bool {
        self.address == address && self.port == port
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Add a worker session; the registry recomputes its derived state.
    pub fn register(&self, downstream: Arc<Downstream>) {
        self.registry.write().insert(downstream);
    }

    /// Reaper hook: drop downstreams whose sessions have died.
    pub fn evict_closed(&self) -> usize {
        self.registry.write().evict_closed()
    }

    /// Whether the listener has sat empty long enough to be collected.
    pub fn idle_expired(&self, timeout: Duration) -> bool {
        let registry = self.registry.read();
        match registry.last_update() {
            Some(at) => registry.is_empty() && at.elapsed() >= timeout,
            None => false,
        }
    }

    /// Stop the accept loop. The listening socket is dropped by the loop
    /// itself, which frees the port. Idempotent, callable from any task.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run the public accept loop until the listener is closed or accept
    /// fails non-transiently. On exit the listener removes itself from the
    /// broker's index.
    pub fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener, shared: Arc<Shared>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, peer)) => {
                            debug!("public connection from {} on {}", peer, this.endpoint());
                            let router = Arc::clone(&this);
                            tokio::spawn(async move { router.route(conn).await });
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!("transient accept error on {}: {}", this.endpoint(), e);
                            sleep(ACCEPT_RETRY_DELAY).await;
                        }
                        Err(e) => {
                            error!("accept loop on {} failed: {}", this.endpoint(), e);
                            break;
                        }
                    }
                }
            }
            drop(listener);
            this.close();
            shared.remove_listener(this.id);
            info!("closed upstream listener on {}", this.endpoint());
        });
    }

    /// Dispatch one inbound public connection.
    async fn route(self: Arc<Self>, conn: TcpStream) {
        let snapshot = self.registry.read().snapshot();

        let stream: Stream = match &snapshot.tls {
            Some(acceptor) => match acceptor.accept(conn).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    debug!("tls handshake failed on {}: {}", self.endpoint(), e);
                    return;
                }
            },
            None => Box::new(conn),
        };

        if snapshot.any_http {
            self.route_http(stream).await;
        } else {
            self.route_opaque(stream, snapshot).await;
        }
    }

    /// Opaque TCP mode: pair the connection with the first worker that will
    /// take a stream, then splice until either side finishes.
    async fn route_opaque(&self, inbound: Stream, snapshot: RouteSnapshot) {
        for downstream in snapshot.downstream {
            match downstream.session.open_stream().await {
                Ok(stream) => {
                    let (up, down) = splice(inbound, stream).await;
                    debug!(
                        "connection on {} finished (up {} bytes, down {} bytes)",
                        self.endpoint(),
                        up,
                        down
                    );
                    return;
                }
                Err(e) => {
                    warn!("failed to open stream on downstream {}: {}", downstream.id, e);
                    downstream.session.close().await;
                    self.remove_downstream(downstream.id);
                }
            }
        }
        debug!("no live downstream for {}; dropping connection", self.endpoint());
    }

    /// HTTP mode: a keep-alive pipeline of request/response pairs, each
    /// request dispatched to the first worker whose predicate matches.
    async fn route_http(&self, conn: Stream) {
        let (read_half, mut write_half) = tokio::io::split(conn);
        let mut reader = BufReader::new(read_half);
        // The stream used for the previous request, kept so a change of
        // worker can close it explicitly.
        let mut current: Option<(u64, MuxStream)> = None;

        loop {
            let req = match Request::read_from(&mut reader).await {
                Ok(req) => req,
                Err(crate::error::Error::Closed) => return,
                Err(e) => {
                    debug!("bad inbound request on {}: {}", self.endpoint(), e);
                    return;
                }
            };

            let deadline = Instant::now() + self.missing_route_timeout;
            let (id, mut stream) = loop {
                let Some(downstream) = self.find_route(req.host(), req.path()) else {
                    if Instant::now() >= deadline {
                        debug!(
                            "no route for host {:?} path {:?} on {}",
                            req.host(),
                            req.path(),
                            self.endpoint()
                        );
                        let _ = Response::not_found().write_to(&mut write_half).await;
                        return;
                    }
                    sleep(ROUTE_POLL_INTERVAL).await;
                    continue;
                };

                let switched = matches!(&current, Some((previous_id, _)) if *previous_id != downstream.id);
                if switched {
                    // Dropping the handle closes the stream, not the
                    // session.
                    current = None;
                }

                match downstream.session.open_stream().await {
                    Ok(stream) => break (downstream.id, stream),
                    Err(e) => {
                        warn!(
                            "failed to open stream on downstream {}: {}",
                            downstream.id, e
                        );
                        downstream.session.close().await;
                        self.remove_downstream(downstream.id);
                    }
                }
            };

            if req.write_to(&mut stream).await.is_err() {
                return;
            }
            let response = {
                let mut stream_reader = BufReader::new(&mut stream);
                let head = req.method.eq_ignore_ascii_case("HEAD");
                match Response::read_from(&mut stream_reader, head).await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("bad downstream response on {}: {}", self.endpoint(), e);
                        return;
                    }
                }
            };
            if response.write_to(&mut write_half).await.is_err() {
                return;
            }
            let _ = write_half.flush().await;

            current = Some((id, stream));
        }
    }

    fn find_route(&self, host: &str, path: &str) -> Option<Arc<Downstream>> {
        self.registry.read().find_http_match(host, path)
    }

    fn remove_downstream(&self, id: u64) {
        if self.registry.write().remove(id) {
            info!("removed downstream {} from {}", id, self.endpoint());
        }
    }
}

impl std::fmt::Debug for UpstreamListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamListener")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("downstream", &self.registry.read().len())
            .finish()
    }
}
