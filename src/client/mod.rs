//! Worker-side library
//!
//! A worker does not bind its port itself. It dials the broker, announces
//! the socket it wants served, and then accepts work over the multiplexed
//! control connection: every public client the broker accepts on the
//! worker's behalf arrives as one new stream.
//!
//! [`connect`] is the one-shot form: a single control connection, failing
//! when it drops. [`Listener`] wraps it with re-establishment: `accept`
//! transparently redials a dropped broker connection, giving up only after
//! a total deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mux::{MuxSession, MuxStream};
use crate::protocol::codec::Codec;
use crate::protocol::{HandshakeRequest, SocketDefinition};

/// Where a broker listens unless told otherwise.
pub const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:9999";

/// Total time `Listener::accept` keeps re-establishing a dropped control
/// connection before failing.
pub const DEFAULT_ACCEPT_DEADLINE: Duration = Duration::from_secs(30);

/// Pause between re-establishment attempts.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Open a control connection, perform the handshake, and return the
/// multiplexed session on which broker-accepted connections arrive.
pub async fn connect(broker_addr: &str, def: SocketDefinition) -> Result<MuxSession> {
    let mut conn = TcpStream::connect(broker_addr).await?;
    let codec = Codec::new();

    codec
        .write_handshake_request(&mut conn, &HandshakeRequest { socket: def })
        .await?;
    let response = codec.read_handshake_response(&mut conn).await?;
    if !response.is_ok() {
        return Err(Error::Handshake(response.status));
    }

    // The broker plays multiplexer client; the worker plays server.
    Ok(MuxSession::server(conn))
}

/// A reconnecting listener over a broker registration.
pub struct Listener {
    broker_addr: String,
    def: SocketDefinition,
    session: Mutex<Option<Arc<MuxSession>>>,
    accept_deadline: Duration,
}

impl Listener {
    /// Register lazily: no connection is made until the first `accept`.
    pub fn bind(broker_addr: impl Into<String>, def: SocketDefinition) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            def,
            session: Mutex::new(None),
            accept_deadline: DEFAULT_ACCEPT_DEADLINE,
        }
    }

    /// Override the total accept deadline.
    pub fn with_accept_deadline(mut self, deadline: Duration) -> Self {
        self.accept_deadline = deadline;
        self
    }

    /// Wait for the broker to hand over a public connection, redialing the
    /// control connection as needed. Fails with [`Error::Timeout`] once the
    /// deadline has passed without a usable connection.
    pub async fn accept(&self) -> Result<MuxStream> {
        let deadline = Instant::now() + self.accept_deadline;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            let session = match self.session().await {
                Ok(session) => session,
                Err(e) => {
                    debug!("broker connection failed: {}", e);
                    sleep(RECONNECT_PAUSE).await;
                    continue;
                }
            };

            match session.accept_stream().await {
                Ok(stream) => return Ok(stream),
                Err(_) => {
                    self.clear_session(&session).await;
                    session.close().await;
                    sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }

    /// Drop the control connection. The next `accept` redials.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    async fn session(&self) -> Result<Arc<MuxSession>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(Arc::clone(session));
            }
        }
        let session = Arc::new(connect(&self.broker_addr, self.def.clone()).await?);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn clear_session(&self, stale: &Arc<MuxSession>) {
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, stale) {
                *guard = None;
            }
        }
    }
}
