//! Stream multiplexer sessions
//!
//! One control connection carries many virtual streams. The yamux framing,
//! flow control, and keepalives come from `tokio-yamux`; this module owns
//! the session lifecycle around it:
//!
//! - a driver task polls the session, collecting inbound streams and
//!   noticing when the peer goes away
//! - [`MuxSession`] exposes the four operations the rest of the system
//!   needs: `open_stream`, `accept_stream`, `is_closed`, `close`
//!
//! The broker wraps its end of a worker connection as the yamux *client*
//! (it opens streams); the worker wraps its end as the *server* (it accepts
//! them).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_yamux::config::Config;
use tokio_yamux::Control;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;
use tracing::debug;

use crate::error::{Error, Result};

/// A single multiplexed stream. Reads and writes like any other socket.
pub type MuxStream = StreamHandle;

/// One end of a multiplexed session over a byte stream.
pub struct MuxSession {
    control: Control,
    incoming: Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    /// Wrap the stream as the session's client side (the end that opens
    /// streams). The broker uses this for accepted worker connections.
    pub fn client<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(Session::new_client(io, Config::default()))
    }

    /// Wrap the stream as the session's server side (the end that accepts
    /// streams). Workers use this after a successful handshake.
    pub fn server<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(Session::new_server(io, Config::default()))
    }

    fn spawn<S>(mut session: Session<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        // Drive the session until the peer disappears. Inbound streams are
        // parked in the channel for accept_stream.
        let driver_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            loop {
                match session.next().await {
                    Some(Ok(stream)) => {
                        if tx.send(stream).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("mux session ended: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            driver_closed.store(true, Ordering::SeqCst);
        });

        Self {
            control,
            incoming: Mutex::new(rx),
            closed,
        }
    }

    /// Open a new outbound stream. Fails once the peer has gone away.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| Error::Mux(e.to_string()))
    }

    /// Wait for the peer to open a stream. Fails once the session is closed
    /// and no buffered streams remain.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(Error::Closed)
    }

    /// Non-blocking liveness check.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session and all of its streams. Safe to call from any task
    /// and more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut control = self.control.clone();
        let _ = control.close().await;
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("closed", &self.is_closed())
            .finish()
    }
}
