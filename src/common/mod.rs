//! Common types and abstractions
//!
//! This module defines what the routing path shares:
//! - Stream: one type for a routed public connection, TLS-wrapped or not
//! - splice: bidirectional byte relay with shared shutdown

mod pipe;

pub use pipe::splice;

// Re-export error types from crate root
pub use crate::error::{Error, Result};

use tokio::io::{AsyncRead, AsyncWrite};

/// A routed public connection. A connection enters routing as raw TCP and
/// may pick up a TLS wrapper on the way; past that decision everything
/// handles both through this one type.
pub type Stream = Box<dyn RoutedIo + Unpin + Send>;

/// Object-safe bundle of the I/O traits a routed connection carries.
pub trait RoutedIo: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> RoutedIo for T {}
