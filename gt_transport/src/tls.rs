//! TLS material and QUIC crypto configuration.
//!
//! Certificates and keys are opaque to the transport: a server presents a
//! [`TlsIdentity`], a client brings a [`ClientTls`] trust policy. Both are
//! turned into `quinn` configs carrying the ALPN tag and the transport
//! tuning shared by every engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::congestion::BbrConfig;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig};
use rustls::crypto::CryptoProvider;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::transport::{TransportError, TransportResult};

/// ALPN protocol tag negotiated on every connection.
pub const ALPN: &str = "gt-quic";

/// Congestion controller used by a software engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Congestion {
    /// quinn's default controller
    #[default]
    Cubic,
    /// Bottleneck bandwidth and round-trip propagation time
    Bbr,
}

/// Transport parameters applied on both sides of a connection.
#[derive(Debug, Clone)]
pub struct QuicTuning {
    pub alpn: Vec<u8>,
    pub idle_timeout: Duration,
    pub keep_alive: Option<Duration>,
    pub congestion: Congestion,
}

impl Default for QuicTuning {
    fn default() -> Self {
        QuicTuning {
            alpn: ALPN.as_bytes().to_vec(),
            idle_timeout: Duration::from_secs(30),
            keep_alive: Some(Duration::from_secs(10)),
            congestion: Congestion::Cubic,
        }
    }
}

/// Certificate chain and private key a listener presents.
#[derive(Debug)]
pub struct TlsIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        TlsIdentity {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        TlsIdentity { cert_chain, key }
    }

    /// Generates a self-signed identity valid for `hosts`.
    pub fn self_signed(hosts: &[&str]) -> TransportResult<Self> {
        let names: Vec<String> = hosts.iter().map(|host| host.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| TransportError::Tls(format!("Failed to generate certificate: {e}")))?;
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        Ok(TlsIdentity {
            cert_chain: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(key),
        })
    }

    /// Loads a PEM certificate chain and a PEM private key.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> TransportResult<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert_chain = CertificateDer::pem_file_iter(cert_path)
            .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
            .map_err(|e| TransportError::Tls(format!("{}: {e}", cert_path.display())))?;
        if cert_chain.is_empty() {
            return Err(TransportError::Tls(format!(
                "{}: no certificates found",
                cert_path.display()
            )));
        }
        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|e| TransportError::Tls(format!("{}: {e}", key_path.display())))?;
        Ok(TlsIdentity { cert_chain, key })
    }

    /// End-entity certificate, for clients that pin it.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }
}

/// How a client verifies the server.
#[derive(Debug, Clone)]
pub enum Trust {
    /// Accept any certificate
    Insecure,
    /// Accept certificates chaining to one of these roots
    Roots(Vec<CertificateDer<'static>>),
}

/// Client side TLS policy.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub trust: Trust,
    /// Name used for SNI and verification; defaults to the dialed host
    pub server_name: Option<String>,
}

impl ClientTls {
    pub fn insecure() -> Self {
        ClientTls {
            trust: Trust::Insecure,
            server_name: None,
        }
    }

    pub fn trusting(root: CertificateDer<'static>) -> Self {
        ClientTls {
            trust: Trust::Roots(vec![root]),
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(err.to_string())
}

fn transport_config(tuning: &QuicTuning) -> TransportResult<TransportConfig> {
    let idle = IdleTimeout::try_from(tuning.idle_timeout).map_err(|_| {
        TransportError::Configuration(format!(
            "idle timeout {:?} is out of range",
            tuning.idle_timeout
        ))
    })?;
    let mut config = TransportConfig::default();
    config.max_idle_timeout(Some(idle));
    config.keep_alive_interval(tuning.keep_alive);
    if tuning.congestion == Congestion::Bbr {
        config.congestion_controller_factory(Arc::new(BbrConfig::default()));
    }
    Ok(config)
}

/// Builds the listener side QUIC config.
pub fn server_config(
    identity: &TlsIdentity,
    tuning: &QuicTuning,
) -> TransportResult<quinn::ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())
        .map_err(tls_error)?;
    crypto.alpn_protocols = vec![tuning.alpn.clone()];

    let crypto = QuicServerConfig::try_from(crypto).map_err(tls_error)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(tuning)?));
    Ok(config)
}

/// Builds the dialing side QUIC config.
pub fn client_config(tls: &ClientTls, tuning: &QuicTuning) -> TransportResult<quinn::ClientConfig> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?;
    let mut crypto = match &tls.trust {
        Trust::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                provider,
            )))
            .with_no_client_auth(),
        Trust::Roots(certs) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in certs {
                roots.add(cert.clone()).map_err(tls_error)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    crypto.alpn_protocols = vec![tuning.alpn.clone()];

    let crypto = QuicClientConfig::try_from(crypto).map_err(tls_error)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(tuning)?));
    Ok(config)
}

/// Verifier that skips certificate checks, for `Trust::Insecure`.
pub mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

    /// Accepts any server certificate. Handshake signatures are still checked.
    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            NoCertificateVerification(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
