//! Wire codec for the handshake exchange.
//!
//! Length-prefixed, big-endian, byte-oriented. Primitive encodings:
//!
//! ```text
//! int          8 bytes, big-endian, two's complement
//! byte         1 raw byte
//! string       int length, then that many bytes
//! byte-string  int length, then that many raw bytes
//! map          int count, then count x (string, string)
//! socket def   string address, int port, byte flags,
//!              [string domain_suffix, string path_prefix]  if flags & 0x01
//!              [string cert_pem, string key_pem]           if flags & 0x02
//! ```
//!
//! Every length-prefixed field is bounded by a configurable cap so a hostile
//! peer cannot force an arbitrary allocation. Short reads and oversized
//! lengths are protocol errors; the caller closes the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::{HandshakeRequest, HandshakeResponse, HttpRule, SocketDefinition, TlsMaterial};

/// Flag bit: the socket definition carries an HTTP routing predicate.
const FLAG_HTTP: u8 = 1 << 0;
/// Flag bit: the socket definition carries TLS material.
const FLAG_TLS: u8 = 1 << 1;

/// Default upper bound for any single length-prefixed field (1 MiB). PEM
/// certificate chains fit comfortably; nothing legitimate comes close.
pub const DEFAULT_MAX_FIELD_LEN: usize = 1 << 20;

/// Handshake encoder/decoder.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_field_len: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            max_field_len: DEFAULT_MAX_FIELD_LEN,
        }
    }

    /// Override the per-field allocation cap.
    pub fn with_max_field_len(max_field_len: usize) -> Self {
        Self { max_field_len }
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    pub async fn read_int<R>(&self, r: &mut R) -> Result<i64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)
            .await
            .map_err(|e| Error::Protocol(format!("short read on int: {}", e)))?;
        Ok(i64::from_be_bytes(buf))
    }

    pub async fn read_byte<R>(&self, r: &mut R) -> Result<u8>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf)
            .await
            .map_err(|e| Error::Protocol(format!("short read on byte: {}", e)))?;
        Ok(buf[0])
    }

    pub async fn read_bytes<R>(&self, r: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let len = self.read_int(r).await?;
        if len < 0 || len as usize > self.max_field_len {
            return Err(Error::Protocol(format!("field length {} out of bounds", len)));
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)
            .await
            .map_err(|e| Error::Protocol(format!("short read on field body: {}", e)))?;
        Ok(buf)
    }

    /// Read a string field. Strings are opaque on the wire; malformed UTF-8
    /// is carried through rather than rejected.
    pub async fn read_string<R>(&self, r: &mut R) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let buf = self.read_bytes(r).await?;
        Ok(match String::from_utf8(buf) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    pub async fn read_map<R>(&self, r: &mut R) -> Result<Vec<(String, String)>>
    where
        R: AsyncRead + Unpin,
    {
        let count = self.read_int(r).await?;
        if count < 0 || count as usize > self.max_field_len {
            return Err(Error::Protocol(format!("map count {} out of bounds", count)));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = self.read_string(r).await?;
            let value = self.read_string(r).await?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    pub async fn write_int<W>(&self, w: &mut W, v: i64) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    pub async fn write_byte<W>(&self, w: &mut W, v: u8) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[v]).await?;
        Ok(())
    }

    pub async fn write_bytes<W>(&self, w: &mut W, v: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_int(w, v.len() as i64).await?;
        w.write_all(v).await?;
        Ok(())
    }

    pub async fn write_string<W>(&self, w: &mut W, v: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_bytes(w, v.as_bytes()).await
    }

    pub async fn write_map<W>(&self, w: &mut W, entries: &[(String, String)]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_int(w, entries.len() as i64).await?;
        for (key, value) in entries {
            self.write_string(w, key).await?;
            self.write_string(w, value).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handshake schema
    // ------------------------------------------------------------------

    pub async fn read_socket_definition<R>(&self, r: &mut R) -> Result<SocketDefinition>
    where
        R: AsyncRead + Unpin,
    {
        let address = self.read_string(r).await?;
        let port = self.read_int(r).await?;
        if !(0..=u16::MAX as i64).contains(&port) {
            return Err(Error::Protocol(format!("port {} out of range", port)));
        }
        let flags = self.read_byte(r).await?;

        let http = if flags & FLAG_HTTP != 0 {
            Some(HttpRule {
                domain_suffix: self.read_string(r).await?,
                path_prefix: self.read_string(r).await?,
            })
        } else {
            None
        };
        let tls = if flags & FLAG_TLS != 0 {
            Some(TlsMaterial {
                cert_pem: self.read_string(r).await?,
                key_pem: self.read_string(r).await?,
            })
        } else {
            None
        };

        Ok(SocketDefinition {
            address,
            port: port as u16,
            http,
            tls,
        })
    }

    pub async fn write_socket_definition<W>(&self, w: &mut W, def: &SocketDefinition) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut flags = 0u8;
        if def.http.is_some() {
            flags |= FLAG_HTTP;
        }
        if def.tls.is_some() {
            flags |= FLAG_TLS;
        }

        self.write_string(w, &def.address).await?;
        self.write_int(w, def.port as i64).await?;
        self.write_byte(w, flags).await?;

        if let Some(http) = &def.http {
            self.write_string(w, &http.domain_suffix).await?;
            self.write_string(w, &http.path_prefix).await?;
        }
        if let Some(tls) = &def.tls {
            self.write_string(w, &tls.cert_pem).await?;
            self.write_string(w, &tls.key_pem).await?;
        }
        Ok(())
    }

    pub async fn read_handshake_request<R>(&self, r: &mut R) -> Result<HandshakeRequest>
    where
        R: AsyncRead + Unpin,
    {
        Ok(HandshakeRequest {
            socket: self.read_socket_definition(r).await?,
        })
    }

    pub async fn write_handshake_request<W>(&self, w: &mut W, req: &HandshakeRequest) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_socket_definition(w, &req.socket).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_handshake_response<R>(&self, r: &mut R) -> Result<HandshakeResponse>
    where
        R: AsyncRead + Unpin,
    {
        Ok(HandshakeResponse {
            status: self.read_string(r).await?,
        })
    }

    pub async fn write_handshake_response<W>(&self, w: &mut W, res: &HandshakeResponse) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_string(w, &res.status).await?;
        w.flush().await?;
        Ok(())
    }
}
