//! Downstream registry
//!
//! Each upstream listener owns one registry: the set of live worker
//! sessions registered for its endpoint plus two pieces of state derived
//! from them, the aggregated TLS acceptor and the "any worker wants HTTP
//! routing" flag. Both are recomputed on every mutation so readers never
//! see a stale aggregate.
//!
//! The registry itself is plain data; the owning listener wraps it in a
//! readers-writer lock. Routing takes a snapshot under the read lock and
//! releases it before touching the network.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::mux::MuxSession;
use crate::protocol::SocketDefinition;
use crate::tls;

/// One registered worker: a multiplexed session annotated with the socket
/// definition it announced at handshake.
#[derive(Debug)]
pub(crate) struct Downstream {
    pub id: u64,
    pub session: MuxSession,
    pub def: SocketDefinition,
}

impl Downstream {
    /// Whether this worker's HTTP predicate accepts the given request.
    /// Workers without a predicate never match; empty suffix and prefix
    /// match everything.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        match &self.def.http {
            Some(rule) => {
                host.ends_with(&rule.domain_suffix) && path.starts_with(&rule.path_prefix)
            }
            None => false,
        }
    }
}

/// What a routing task needs from the registry, captured under the read
/// lock. The downstream list is ordered by id, i.e. registration order,
/// which is the deterministic first-match order for dispatch.
pub(crate) struct RouteSnapshot {
    pub tls: Option<TlsAcceptor>,
    pub any_http: bool,
    pub downstream: Vec<Arc<Downstream>>,
}

pub(crate) struct Registry {
    downstream: BTreeMap<u64, Arc<Downstream>>,
    tls: Option<TlsAcceptor>,
    any_http: bool,
    last_update: Option<Instant>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            downstream: BTreeMap::new(),
            tls: None,
            any_http: false,
            last_update: None,
        }
    }

    pub fn insert(&mut self, downstream: Arc<Downstream>) {
        self.downstream.insert(downstream.id, downstream);
        self.rebuild();
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let removed = self.downstream.remove(&id).is_some();
        if removed {
            self.rebuild();
        }
        removed
    }

    /// Drop every downstream whose session reports closed. Derived state is
    /// rebuilt once, after the sweep. Returns how many were evicted.
    pub fn evict_closed(&mut self) -> usize {
        let before = self.downstream.len();
        self.downstream.retain(|_, d| !d.session.is_closed());
        let evicted = before - self.downstream.len();
        if evicted > 0 {
            self.rebuild();
        }
        evicted
    }

    pub fn is_empty(&self) -> bool {
        self.downstream.is_empty()
    }

    pub fn len(&self) -> usize {
        self.downstream.len()
    }

    /// When the registry last changed, if it ever has.
    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            tls: self.tls.clone(),
            any_http: self.any_http,
            downstream: self.downstream.values().cloned().collect(),
        }
    }

    /// First worker, in id order, whose HTTP predicate accepts the request.
    pub fn find_http_match(&self, host: &str, path: &str) -> Option<Arc<Downstream>> {
        self.downstream
            .values()
            .find(|d| d.matches(host, path))
            .cloned()
    }

    /// Recompute everything derived from the membership: the HTTP flag and
    /// the aggregated TLS acceptor. Stamps the update time.
    fn rebuild(&mut self) {
        self.any_http = self.downstream.values().any(|d| d.def.http.is_some());
        self.tls = tls::build_acceptor(
            self.downstream
                .values()
                .filter_map(|d| d.def.tls.as_ref()),
        );
        self.last_update = Some(Instant::now());

        debug!(
            "registry updated: {} downstream(s), http {}, tls {}",
            self.downstream.len(),
            if self.any_http { "enabled" } else { "disabled" },
            if self.tls.is_some() { "enabled" } else { "disabled" },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TlsMaterial;

    /// A session pair over an in-memory transport. The far end must stay
    /// alive or the near end immediately reports closed.
    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (MuxSession::client(a), MuxSession::server(b))
    }

    fn downstream(id: u64, def: SocketDefinition) -> (Arc<Downstream>, MuxSession) {
        let (session, far) = session_pair();
        (Arc::new(Downstream { id, session, def }), far)
    }

    fn tls_material() -> TlsMaterial {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        TlsMaterial {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
        }
    }

    #[tokio::test]
    async fn http_flag_tracks_membership() {
        let mut registry = Registry::new();
        let (plain, _far1) = downstream(1, SocketDefinition::tcp("127.0.0.1", 80));
        let (http, _far2) = downstream(
            2,
            SocketDefinition::tcp("127.0.0.1", 80).with_http("", "/a/"),
        );

        registry.insert(plain);
        assert!(!registry.snapshot().any_http);

        registry.insert(http);
        assert!(registry.snapshot().any_http);

        registry.remove(2);
        assert!(!registry.snapshot().any_http);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn tls_aggregate_tracks_membership() {
        let mut registry = Registry::new();
        let material = tls_material();
        let (secure, _far) = downstream(
            1,
            SocketDefinition::tcp("127.0.0.1", 443).with_tls(material.cert_pem, material.key_pem),
        );

        registry.insert(secure);
        assert!(registry.snapshot().tls.is_some());

        registry.remove(1);
        assert!(registry.snapshot().tls.is_none());
    }

    #[tokio::test]
    async fn bad_certificate_does_not_evict_worker() {
        let mut registry = Registry::new();
        let (bad_cert, _far) = downstream(
            1,
            SocketDefinition::tcp("127.0.0.1", 443)
                .with_http("", "/")
                .with_tls("not pem", "not pem"),
        );

        registry.insert(bad_cert);
        let snapshot = registry.snapshot();
        assert!(snapshot.tls.is_none());
        assert_eq!(snapshot.downstream.len(), 1);
        assert!(snapshot.any_http);
    }

    #[tokio::test]
    async fn first_match_wins_in_id_order() {
        let mut registry = Registry::new();
        let (a, _far1) = downstream(
            2,
            SocketDefinition::tcp("127.0.0.1", 80).with_http("", "/"),
        );
        let (b, _far2) = downstream(
            1,
            SocketDefinition::tcp("127.0.0.1", 80).with_http("", "/"),
        );

        registry.insert(a);
        registry.insert(b);
        // Both match; the lower id registered "first" and wins.
        assert_eq!(registry.find_http_match("any", "/x").unwrap().id, 1);
    }

    #[tokio::test]
    async fn predicate_matching_rules() {
        let (d, _far) = downstream(
            1,
            SocketDefinition::tcp("127.0.0.1", 80).with_http("example.com", "/api/"),
        );

        assert!(d.matches("example.com", "/api/users"));
        assert!(d.matches("sub.example.com", "/api/"));
        assert!(!d.matches("example.org", "/api/"));
        assert!(!d.matches("example.com", "/other/"));

        let (any, _far) = downstream(2, SocketDefinition::tcp("127.0.0.1", 80).with_http("", ""));
        assert!(any.matches("anything", "/anywhere"));

        let (plain, _far) = downstream(3, SocketDefinition::tcp("127.0.0.1", 80));
        assert!(!plain.matches("anything", "/anywhere"));
    }

    #[tokio::test]
    async fn evict_closed_sweeps_dead_sessions() {
        let mut registry = Registry::new();
        let (live, _far_live) = downstream(1, SocketDefinition::tcp("127.0.0.1", 80));
        let (dead, far_dead) = downstream(
            2,
            SocketDefinition::tcp("127.0.0.1", 80).with_http("", "/"),
        );
        registry.insert(live);
        registry.insert(dead);
        assert!(registry.snapshot().any_http);

        far_dead.close().await;
        // The near end notices asynchronously.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if registry.evict_closed() == 1 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dead session never evicted");

        assert_eq!(registry.len(), 1);
        assert!(!registry.snapshot().any_http);
        assert!(registry.last_update().is_some());
    }
}
