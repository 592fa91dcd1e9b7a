//! TLS client configuration for direct-TCP environments.
//!
//! Session reuse policy differs by auth mode: under mutual TLS resumption is
//! disabled outright so sessions can never be reused across client
//! identities; server-auth-only configs keep rustls' in-memory resumption but
//! are rebuilt after 30 seconds, which bounds TLS-context growth during
//! long-lived polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustls::client::Resumption;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use dockhand_common::{DockhandError, EnvironmentId, Result, TlsMaterial};

const CONFIG_REUSE_WINDOW: Duration = Duration::from_secs(30);

/// Prepared TLS client state for one environment.
#[derive(Clone, Debug)]
pub struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub mutual: bool,
}

struct CachedConfig {
    built_at: Instant,
    tls: ClientTls,
}

/// Per-environment cache of built rustls configs, invalidated together with
/// the environment cache on configuration edits.
#[derive(Default)]
pub struct TlsConfigCache {
    configs: DashMap<EnvironmentId, CachedConfig>,
}

impl TlsConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, environment: EnvironmentId, material: &TlsMaterial) -> Result<ClientTls> {
        if let Some(cached) = self.configs.get(&environment) {
            let reusable = cached.tls.mutual || cached.built_at.elapsed() < CONFIG_REUSE_WINDOW;
            if reusable {
                return Ok(cached.tls.clone());
            }
        }

        debug!(%environment, mutual = material.is_mutual(), "building TLS client config");
        let tls = build_client_tls(material)?;
        self.configs.insert(
            environment,
            CachedConfig {
                built_at: Instant::now(),
                tls: tls.clone(),
            },
        );
        Ok(tls)
    }

    pub fn invalidate(&self, environment: EnvironmentId) {
        self.configs.remove(&environment);
    }

    pub fn clear(&self) {
        self.configs.clear();
    }
}

fn build_client_tls(material: &TlsMaterial) -> Result<ClientTls> {
    let builder = ClientConfig::builder();

    let builder = if material.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
    } else {
        let ca_pem = material.ca_pem.as_deref().ok_or_else(|| {
            DockhandError::Config(
                "TLS environment has no CA certificate and verification is not disabled"
                    .to_string(),
            )
        })?;
        builder.with_root_certificates(root_store(ca_pem)?)
    };

    let mutual = material.is_mutual();
    let mut config = if mutual {
        let certs = parse_certs(material.cert_pem.as_deref().unwrap_or_default())?;
        let key = parse_key(material.key_pem.as_deref().unwrap_or_default())?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| DockhandError::Config(format!("invalid TLS client identity: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    if mutual {
        config.resumption = Resumption::disabled();
    }

    Ok(ClientTls {
        config: Arc::new(config),
        mutual,
    })
}

fn root_store(ca_pem: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in parse_certs(ca_pem)? {
        store
            .add(cert)
            .map_err(|e| DockhandError::Config(format!("invalid CA certificate: {e}")))?;
    }
    if store.is_empty() {
        return Err(DockhandError::Config(
            "CA bundle contains no certificates".to_string(),
        ));
    }
    Ok(store)
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DockhandError::Config(format!("invalid PEM certificate material: {e}")))
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| DockhandError::Config(format!("invalid PEM private key: {e}")))?
        .ok_or_else(|| DockhandError::Config("PEM material contains no private key".to_string()))
}

/// Accepts any server certificate. Only used when an environment explicitly
/// sets `skip_verify`.
#[derive(Debug)]
struct InsecureVerifier {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl InsecureVerifier {
    fn new() -> Self {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
