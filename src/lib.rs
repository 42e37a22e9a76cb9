//! Backhaul - a reverse-tunneling load balancer
//!
//! # Architecture (Inverted Accept)
//!
//! ```text
//! worker ──dial──► Broker (control listener)
//!                    │ handshake: socket definition
//!                    ▼
//!                  UpstreamListener (public bind per address:port)
//!                    │ accept public clients
//!                    ▼
//! public client ──► route: TLS? → HTTP predicate / opaque splice
//!                    │
//!                    ▼
//!                  worker session stream (multiplexed over the dial)
//! ```
//!
//! Workers never bind public ports. Each one opens a single outbound
//! connection to the broker and registers a socket definition; the broker
//! binds the public endpoint, reference-counts it across workers, and hands
//! every accepted connection back as a fresh multiplexed stream. Routing is
//! either opaque TCP (whole connection to one worker) or HTTP (each request
//! matched against worker predicates), with TLS terminated at the broker
//! from worker-supplied certificates.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Stream alias, bidirectional splice
//! ├── protocol/        # Handshake schema, wire codec, HTTP/1.1 messages
//! ├── mux/             # Multiplexer sessions (yamux)
//! ├── tls.rs           # Per-listener TLS aggregation, SNI resolution
//! ├── broker/          # Broker, upstream listeners, registry, reaper
//! └── client/          # Worker-side register + accept library
//! ```

// Core types
pub mod common;
pub mod error;

// Wire and transport layers
pub mod mux;
pub mod protocol;
pub mod tls;

// Broker and worker sides
pub mod broker;
pub mod client;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use broker::Broker;
pub use client::Listener;
pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use protocol::{HttpRule, SocketDefinition, TlsMaterial};
