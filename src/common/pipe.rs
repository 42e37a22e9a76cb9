//! Bidirectional byte relay for opaque TCP forwarding.
//!
//! The relay runs both directions concurrently and tears the pair down as a
//! unit: the moment either direction finishes (EOF or error), both endpoints
//! are shut down. In-order delivery within each direction is inherited from
//! the underlying streams.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy bytes between `a` and `b` in both directions until either direction
/// completes, then shut both write sides down. Returns the byte counts
/// (a→b, b→a) transferred up to that point.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    tokio::select! {
        _ = copy_half(&mut a_read, &mut b_write, &up) => {}
        _ = copy_half(&mut b_read, &mut a_write, &down) => {}
    }

    // The losing direction was cancelled mid-copy; make sure both peers see
    // EOF rather than a stalled connection.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    (up.load(Ordering::Relaxed), down.load(Ordering::Relaxed))
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, count: &AtomicU64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
    buf.resize(RELAY_BUFFER_SIZE, 0);

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        count.fetch_add(n as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
}
