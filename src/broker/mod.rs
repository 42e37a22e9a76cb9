//! Broker - worker registration and public traffic dispatch
//!
//! The broker owns the control listener workers dial into. Each control
//! connection carries one handshake naming a public `(address, port)`
//! endpoint; the broker finds or creates the upstream listener for that
//! endpoint and hands the connection over to it as a multiplexed worker
//! session. Public traffic then flows:
//!
//! ```text
//! public client → UpstreamListener (accept, TLS, route)
//!               → worker session stream (yamux)
//!               → worker process
//! ```
//!
//! A periodic reaper sweeps dead worker sessions out of every listener and
//! collects listeners that have sat empty past the configured timeout.

mod registry;
mod upstream;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, ACCEPT_BACKOFF_INITIAL, ACCEPT_BACKOFF_MAX, REAPER_INTERVAL};
use crate::error::{Error, Result};
use crate::mux::MuxSession;
use crate::protocol::codec::Codec;
use crate::protocol::{HandshakeResponse, SocketDefinition};

use registry::Downstream;
use upstream::UpstreamListener;

/// The central broker process state.
pub struct Broker {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Broker {
    /// Wrap a pre-bound control listener.
    pub fn new(listener: TcpListener, config: BrokerConfig) -> Self {
        Self {
            listener,
            shared: Arc::new(Shared {
                config,
                upstream: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Address of the control listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and register workers until the broker is closed or the
    /// control listener fails non-transiently.
    ///
    /// Transient accept errors back off exponentially from 5ms, capped at
    /// one second, resetting after any successful accept.
    pub async fn serve(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Ok(());
        }

        let reaper = tokio::spawn(run_reaper(Arc::clone(&self.shared)));

        let mut backoff = Duration::ZERO;
        let result = loop {
            tokio::select! {
                _ = self.shared.shutdown.notified() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        backoff = Duration::ZERO;
                        debug!("downstream connection from {}", peer);
                        tokio::spawn(register_worker(Arc::clone(&self.shared), conn, peer));
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        backoff = if backoff.is_zero() {
                            ACCEPT_BACKOFF_INITIAL
                        } else {
                            (backoff * 2).min(ACCEPT_BACKOFF_MAX)
                        };
                        warn!("transient accept error on control listener: {}", e);
                        sleep(backoff).await;
                    }
                    Err(e) => break Err(Error::from(e)),
                }
            }
        };

        reaper.abort();
        result
    }

    /// Close every upstream listener and stop serving. In-flight routed
    /// connections are left to finish on their own. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Broker state shared with upstream listener tasks.
pub(crate) struct Shared {
    config: BrokerConfig,
    upstream: Mutex<HashMap<u64, Arc<UpstreamListener>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    /// Ids are broker-wide and never reused; listeners and downstream
    /// sessions draw from the same counter.
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        let drained: Vec<Arc<UpstreamListener>> =
            self.upstream.lock().drain().map(|(_, u)| u).collect();
        for upstream in drained {
            upstream.close();
        }
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        self.upstream.lock().remove(&id);
    }

    fn find_listener(&self, address: &str, port: u16) -> Option<Arc<UpstreamListener>> {
        self.upstream
            .lock()
            .values()
            .find(|u| u.matches_endpoint(address, port))
            .cloned()
    }

    /// Locate the upstream listener for an endpoint, binding a new public
    /// socket when this is the endpoint's first registration. The index
    /// lock is held only for lookup and insert; the bind happens outside
    /// it, and a lost creation race resolves to the winner's listener.
    async fn find_or_create_listener(
        self: &Arc<Self>,
        def: &SocketDefinition,
    ) -> Result<Arc<UpstreamListener>> {
        if let Some(existing) = self.find_listener(&def.address, def.port) {
            return Ok(existing);
        }

        let listener = match TcpListener::bind((def.address.as_str(), def.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                // A racing registration may have bound the endpoint first.
                if let Some(existing) = self.find_listener(&def.address, def.port) {
                    return Ok(existing);
                }
                return Err(e.into());
            }
        };

        let upstream = UpstreamListener::new(
            self.allocate_id(),
            def.address.clone(),
            def.port,
            self.config.missing_route_timeout,
        );

        {
            let mut index = self.upstream.lock();
            if let Some(existing) = index
                .values()
                .find(|u| u.matches_endpoint(&def.address, def.port))
                .cloned()
            {
                // Lost the race after binding; our socket drops and frees
                // the port.
                return Ok(existing);
            }
            index.insert(upstream.id(), Arc::clone(&upstream));
        }

        info!("opening new upstream listener on {}", upstream.endpoint());
        upstream.spawn_accept_loop(listener, Arc::clone(self));
        Ok(upstream)
    }
}

/// Handle one control connection: handshake, wrap in a multiplexer, attach
/// to the endpoint's upstream listener.
async fn register_worker(shared: Arc<Shared>, mut conn: TcpStream, peer: SocketAddr) {
    let codec = Codec::new();

    let request = match codec.read_handshake_request(&mut conn).await {
        Ok(request) => request,
        Err(e) => {
            warn!("error reading handshake from {}: {}", peer, e);
            return;
        }
    };
    if let Err(e) = codec
        .write_handshake_response(&mut conn, &HandshakeResponse::ok())
        .await
    {
        warn!("error writing handshake response to {}: {}", peer, e);
        return;
    }

    let def = request.socket;
    let downstream = Arc::new(Downstream {
        id: shared.allocate_id(),
        session: MuxSession::client(conn),
        def: def.clone(),
    });

    let upstream = match shared.find_or_create_listener(&def).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(
                "failed to open upstream listener on {}:{}: {}",
                def.address, def.port, e
            );
            downstream.session.close().await;
            return;
        }
    };

    info!(
        "registered downstream {} from {} on {}",
        downstream.id,
        peer,
        upstream.endpoint()
    );
    upstream.register(downstream);
}

/// Periodic sweep: evict dead worker sessions, then collect listeners that
/// have been empty past the configured timeout.
async fn run_reaper(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shared.is_closed() {
            return;
        }

        let listeners: Vec<Arc<UpstreamListener>> =
            shared.upstream.lock().values().cloned().collect();
        for upstream in listeners {
            let evicted = upstream.evict_closed();
            if evicted > 0 {
                info!(
                    "evicted {} dead downstream(s) from {}",
                    evicted,
                    upstream.endpoint()
                );
            }
            if upstream.idle_expired(shared.config.empty_listener_timeout) {
                info!("collecting idle upstream listener on {}", upstream.endpoint());
                upstream.close();
                shared.remove_listener(upstream.id());
            }
        }
    }
}

/// Accept errors worth retrying rather than treating as fatal.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use crate::protocol::http::{Request, Response};
    use std::sync::Arc;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Duration};
    use tokio_rustls::rustls;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    struct TestBroker {
        broker: Arc<Broker>,
        addr: String,
        handle: JoinHandle<Result<()>>,
    }

    async fn spawn_broker(config: BrokerConfig) -> TestBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let broker = Arc::new(Broker::new(listener, config));
        let serving = Arc::clone(&broker);
        let handle = tokio::spawn(async move { serving.serve().await });
        TestBroker {
            broker,
            addr,
            handle,
        }
    }

    /// Run a worker that answers every request on every stream with a fixed
    /// body.
    fn serve_http(session: Arc<MuxSession>, body: &'static str) {
        tokio::spawn(async move {
            while let Ok(stream) = session.accept_stream().await {
                tokio::spawn(async move {
                    let (read_half, mut write_half) = tokio::io::split(stream);
                    let mut reader = BufReader::new(read_half);
                    while Request::read_from(&mut reader).await.is_ok() {
                        if Response::ok_with_body(body)
                            .write_to(&mut write_half)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
    }

    async fn request_over<S>(conn: S, host: &str, path: &str) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(conn);
        let request = Request {
            method: "GET".to_string(),
            target: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), host.to_string())],
            body: Vec::new(),
        };
        request.write_to(&mut write_half).await.unwrap();
        let mut reader = BufReader::new(read_half);
        let response = Response::read_from(&mut reader, false).await.unwrap();
        String::from_utf8(response.body).unwrap()
    }

    async fn http_get(endpoint: &str, path: &str) -> String {
        let conn = TcpStream::connect(endpoint).await.unwrap();
        request_over(conn, endpoint, path).await
    }

    #[tokio::test]
    async fn opaque_fan_in() {
        let broker = spawn_broker(BrokerConfig::default()).await;
        let session = Arc::new(
            client::connect(&broker.addr, SocketDefinition::tcp("127.0.0.1", 8999))
                .await
                .unwrap(),
        );

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(5);
        let accepting = Arc::clone(&session);
        tokio::spawn(async move {
            for _ in 0..5 {
                let mut stream = accepting.accept_stream().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    tx.send(buf).await.unwrap();
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..5 {
            tokio::spawn(async {
                let mut conn = TcpStream::connect("127.0.0.1:8999").await.unwrap();
                conn.write_all(b"Hello World").await.unwrap();
                conn.shutdown().await.unwrap();
            });
        }

        for _ in 0..5 {
            let received = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for stream")
                .unwrap();
            assert_eq!(received, b"Hello World");
        }

        broker.broker.close();
    }

    #[tokio::test]
    async fn http_path_demultiplex() {
        let broker = spawn_broker(BrokerConfig::default()).await;

        let worker_a = Arc::new(
            client::connect(
                &broker.addr,
                SocketDefinition::tcp("127.0.0.1", 18992).with_http("", "/a/"),
            )
            .await
            .unwrap(),
        );
        serve_http(worker_a, "a");

        let worker_b = Arc::new(
            client::connect(
                &broker.addr,
                SocketDefinition::tcp("127.0.0.1", 18992).with_http("", "/b/"),
            )
            .await
            .unwrap(),
        );
        serve_http(worker_b, "b");

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(http_get("127.0.0.1:18992", "/a/").await, "a");
        assert_eq!(http_get("127.0.0.1:18992", "/b/").await, "b");

        // Keep-alive pipeline that switches workers between requests.
        let conn = TcpStream::connect("127.0.0.1:18992").await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(conn);
        let mut reader = BufReader::new(read_half);
        for (path, expected) in [("/a/", "a"), ("/b/", "b"), ("/a/", "a")] {
            let request = Request {
                method: "GET".to_string(),
                target: path.to_string(),
                version: "HTTP/1.1".to_string(),
                headers: vec![("Host".to_string(), "127.0.0.1:18992".to_string())],
                body: Vec::new(),
            };
            request.write_to(&mut write_half).await.unwrap();
            let response = Response::read_from(&mut reader, false).await.unwrap();
            assert_eq!(String::from_utf8(response.body).unwrap(), expected);
        }

        broker.broker.close();
    }

    #[tokio::test]
    async fn tls_termination() {
        let broker = spawn_broker(BrokerConfig::default()).await;

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let worker = Arc::new(
            client::connect(
                &broker.addr,
                SocketDefinition::tcp("127.0.0.1", 18993)
                    .with_http("", "/a/")
                    .with_tls(cert.cert.pem(), cert.key_pair.serialize_pem()),
            )
            .await
            .unwrap(),
        );
        serve_http(worker, "a");

        tokio::time::sleep(Duration::from_millis(100)).await;

        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let conn = TcpStream::connect("127.0.0.1:18993").await.unwrap();
        let tls_stream = connector
            .connect(ServerName::try_from("localhost").unwrap(), conn)
            .await
            .unwrap();

        assert_eq!(request_over(tls_stream, "127.0.0.1:18993", "/a/").await, "a");

        broker.broker.close();
    }

    #[tokio::test]
    async fn late_route_is_served_not_404d() {
        let broker = spawn_broker(BrokerConfig::default()).await;

        // A first worker brings the listener up in HTTP mode but does not
        // match the request path.
        let worker_a = Arc::new(
            client::connect(
                &broker.addr,
                SocketDefinition::tcp("127.0.0.1", 18994).with_http("", "/a/"),
            )
            .await
            .unwrap(),
        );
        serve_http(worker_a, "a");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fetch = tokio::spawn(async { http_get("127.0.0.1:18994", "/x/").await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        let worker_x = Arc::new(
            client::connect(
                &broker.addr,
                SocketDefinition::tcp("127.0.0.1", 18994).with_http("", "/x/"),
            )
            .await
            .unwrap(),
        );
        serve_http(worker_x, "x");

        let body = timeout(Duration::from_secs(10), fetch)
            .await
            .expect("request timed out")
            .unwrap();
        assert_eq!(body, "x");

        broker.broker.close();
    }

    #[tokio::test]
    async fn missing_route_answers_404() {
        let config = BrokerConfig {
            missing_route_timeout: Duration::from_millis(300),
            ..BrokerConfig::default()
        };
        let broker = spawn_broker(config).await;

        let worker = Arc::new(
            client::connect(
                &broker.addr,
                SocketDefinition::tcp("127.0.0.1", 18998).with_http("", "/a/"),
            )
            .await
            .unwrap(),
        );
        serve_http(worker, "a");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn = TcpStream::connect("127.0.0.1:18998").await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(conn);
        let request = Request {
            method: "GET".to_string(),
            target: "/nope/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), "127.0.0.1:18998".to_string())],
            body: Vec::new(),
        };
        request.write_to(&mut write_half).await.unwrap();
        let mut reader = BufReader::new(read_half);
        let response = Response::read_from(&mut reader, false).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, b"Not Found");

        broker.broker.close();
    }

    #[tokio::test]
    async fn dead_worker_is_reaped_and_port_freed() {
        let config = BrokerConfig {
            empty_listener_timeout: Duration::from_secs(1),
            ..BrokerConfig::default()
        };
        let broker = spawn_broker(config).await;

        let session = client::connect(&broker.addr, SocketDefinition::tcp("127.0.0.1", 18995))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The public endpoint is live.
        TcpStream::connect("127.0.0.1:18995").await.unwrap();

        session.close().await;

        // Eviction within a reaper tick, collection after the idle window;
        // the port is then free to rebind.
        timeout(Duration::from_secs(10), async {
            loop {
                if TcpListener::bind("127.0.0.1:18995").await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await
        .expect("public port never freed");

        broker.broker.close();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = spawn_broker(BrokerConfig::default()).await;

        let _session = client::connect(&broker.addr, SocketDefinition::tcp("127.0.0.1", 18996))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        broker.broker.close();
        broker.broker.close();

        let result = timeout(Duration::from_secs(5), broker.handle)
            .await
            .expect("serve did not stop")
            .unwrap();
        assert!(result.is_ok());

        // All public ports are released.
        timeout(Duration::from_secs(5), async {
            loop {
                if TcpListener::bind("127.0.0.1:18996").await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("public port never freed");
    }

    #[tokio::test]
    async fn malformed_handshake_does_not_kill_broker() {
        let broker = spawn_broker(BrokerConfig::default()).await;

        // Garbage that fails the length-prefixed decode.
        let mut bad = TcpStream::connect(&broker.addr).await.unwrap();
        bad.write_all(&[0xff; 16]).await.unwrap();
        bad.shutdown().await.unwrap();

        // The broker keeps accepting registrations afterwards.
        let session = client::connect(&broker.addr, SocketDefinition::tcp("127.0.0.1", 18997))
            .await
            .unwrap();
        assert!(!session.is_closed());

        broker.broker.close();
    }

    /// Certificate verifier that accepts anything, for testing against
    /// self-signed workers.
    #[derive(Debug)]
    struct InsecureVerifier;

    impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::RSA_PKCS1_SHA384,
                rustls::SignatureScheme::RSA_PKCS1_SHA512,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA512,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }
}
