//! Root-of-trust handling for secure channel implementations

use crate::error::{Result, VpnError};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Preloaded root of trust the gateway certificate must chain to
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    roots: Arc<RootCertStore>,
    certificates: Vec<CertificateDer<'static>>,
}

impl TrustAnchor {
    /// Parse one or more PEM certificates
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::Config`] when the PEM is malformed or holds no
    /// certificate, and [`VpnError::Tls`] when rustls rejects a certificate.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut reader = BufReader::new(pem);
        let certificates = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VpnError::Config(format!("Invalid certificate: {e}")))?;

        if certificates.is_empty() {
            return Err(VpnError::Config(
                "Trust anchor contains no certificates".to_string(),
            ));
        }

        let mut roots = RootCertStore::empty();
        for cert in &certificates {
            roots.add(cert.clone())?;
        }

        Ok(Self {
            roots: Arc::new(roots),
            certificates,
        })
    }

    /// Load a PEM trust anchor from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read(path).map_err(|e| {
            VpnError::Config(format!(
                "Cannot open certificate file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_pem(&pem)
    }

    /// Public web PKI roots, used when no private CA is configured
    pub fn webpki_roots() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            roots: Arc::new(roots),
            certificates: Vec::new(),
        }
    }

    /// Root store for channel implementations
    pub fn roots(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }

    /// DER certificates this anchor was loaded from (empty for web PKI roots)
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Certificate verifier bound to this anchor
    pub fn server_verifier(&self) -> Result<Arc<WebPkiServerVerifier>> {
        WebPkiServerVerifier::builder_with_provider(self.roots.clone(), crypto_provider())
            .build()
            .map_err(|e| VpnError::Tls(format!("Cannot build certificate verifier: {e}")))
    }
}

// Prefer ring if both features are enabled (for CI --all-features)
#[cfg(feature = "ring-crypto")]
fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
