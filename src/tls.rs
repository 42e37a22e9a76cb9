//! TLS aggregation for upstream listeners
//!
//! Workers may hand the broker a PEM certificate/key pair at registration;
//! the broker terminates TLS on the public side using the union of all
//! material currently registered on a listener. Certificate selection is by
//! SNI: each certificate is indexed under its SAN DNS names (subject CN when
//! no SAN is present), with exact match first, then a single-label wildcard,
//! then the first certificate as fallback so clients that send no server
//! name (IP connections) still complete a handshake.
//!
//! A pair that fails to parse is dropped with a warning; the worker that
//! sent it stays registered and can still serve plain routes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::warn;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use crate::error::{Error, Result};
use crate::protocol::TlsMaterial;

/// Build a TLS acceptor from every parseable certificate pair, or `None`
/// when nothing parseable was offered.
pub fn build_acceptor<'a, I>(materials: I) -> Option<TlsAcceptor>
where
    I: IntoIterator<Item = &'a TlsMaterial>,
{
    let mut by_name: HashMap<String, Arc<CertifiedKey>> = HashMap::new();
    let mut fallback: Option<Arc<CertifiedKey>> = None;

    for material in materials {
        let (key, names) = match load_certified_key(material) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("dropping unparseable tls certificate: {}", e);
                continue;
            }
        };
        for name in names {
            by_name.entry(name).or_insert_with(|| Arc::clone(&key));
        }
        fallback.get_or_insert(key);
    }

    let fallback = fallback?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver { by_name, fallback }));
    Some(TlsAcceptor::from(Arc::new(config)))
}

/// Parse one PEM pair into a signing-ready certificate plus the DNS names
/// it should be indexed under.
fn load_certified_key(material: &TlsMaterial) -> Result<(Arc<CertifiedKey>, Vec<String>)> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut material.cert_pem.as_bytes())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Tls(format!("bad certificate pem: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate in pem".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())
        .map_err(|e| Error::Tls(format!("bad key pem: {}", e)))?
        .ok_or_else(|| Error::Tls("no private key in pem".into()))?;
    let signing_key =
        any_supported_type(&key).map_err(|e| Error::Tls(format!("unsupported key: {}", e)))?;

    let names = certificate_names(&certs[0]);
    Ok((Arc::new(CertifiedKey::new(certs, signing_key)), names))
}

/// SAN DNS names of the end-entity certificate, or the subject CN when the
/// certificate carries no SAN extension.
fn certificate_names(cert: &CertificateDer<'_>) -> Vec<String> {
    let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    for ext in parsed.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for general_name in &san.general_names {
                if let GeneralName::DNSName(name) = general_name {
                    names.push(name.to_ascii_lowercase());
                }
            }
        }
    }
    if names.is_empty() {
        if let Some(cn) = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            names.push(cn.to_ascii_lowercase());
        }
    }
    names
}

/// SNI-indexed certificate store aggregated from all registered workers.
struct SniResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    fallback: Arc<CertifiedKey>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(server_name) = client_hello.server_name() {
            let name = server_name.to_ascii_lowercase();
            if let Some(key) = self.by_name.get(&name) {
                return Some(Arc::clone(key));
            }
            // Single-label wildcard: foo.example.com -> *.example.com
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(key) = self.by_name.get(&format!("*.{}", parent)) {
                    return Some(Arc::clone(key));
                }
            }
        }
        Some(Arc::clone(&self.fallback))
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}
