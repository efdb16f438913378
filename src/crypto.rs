//! # TLS Identity
//!
//! Certificate generation and verification for the QUIC peer transport.
//!
//! ## Identity Model
//!
//! - **Identity = Public Key**: the 32-byte Ed25519 key IS the peer's identity
//! - **Self-Signed Certs**: each node derives its certificate from its keypair
//! - **Mutual Auth**: both sides present a certificate, and both sides check
//!   the key inside it
//! - **Pinning via SNI**: the dialer encodes the expected pubkey in the server
//!   name; a listener presenting any other key fails the handshake
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` rustls APIs are used intentionally: trust comes from the
//! certificate's key matching an expected identity, not from a CA chain.

use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::{ClientConfig, IdleTimeout, ServerConfig, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::config::EndpointConfig;
use crate::identity::{Identity, Keypair};

/// Crypto provider shared by every TLS config built here.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for storage-node QUIC traffic.
pub const ALPN: &[u8] = b"oxenstorage";

/// Maximum concurrent streams per connection. Traffic rides a single control
/// stream, so a handful is plenty.
const MAX_CONCURRENT_STREAMS: u32 = 8;

/// DER prefix of a PKCS#8 v1 document wrapping a raw Ed25519 seed (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // version 0
    0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, // AlgorithmIdentifier: id-Ed25519
    0x04, 0x22, 0x04, 0x20, // OCTET STRING { OCTET STRING (32 bytes) }
];

// ============================================================================
// Certificates
// ============================================================================

/// A node's certificate and the key it was issued for.
pub struct TlsIdentity {
    certificate: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Issue a self-signed certificate for `keypair`. Its subject names the
    /// identity the way dialers address it, so the certificate is valid for
    /// the SNI peers will use.
    pub fn generate(keypair: &Keypair) -> Result<Self> {
        let pkcs8 = ed25519_pkcs8(&keypair.secret_key_bytes());
        let signing_key = rcgen::KeyPair::try_from(&PrivatePkcs8KeyDer::from(pkcs8.clone()))
            .context("failed to load Ed25519 key for certificate")?;

        let identity = keypair.identity();
        let mut params = rcgen::CertificateParams::new(vec![identity_to_sni(&identity)])
            .context("failed to create certificate params")?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, rcgen::DnValue::Utf8String(identity.to_hex()));

        let certificate = params
            .self_signed(&signing_key)
            .context("failed to self-sign Ed25519 certificate")?;

        Ok(Self {
            certificate: CertificateDer::from(certificate.der().to_vec()),
            key: PrivateKeyDer::Pkcs8(pkcs8.into()),
        })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.certificate.clone()]
    }
}

fn ed25519_pkcs8(seed: &[u8; 32]) -> Vec<u8> {
    let mut der = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + seed.len());
    der.extend_from_slice(&ED25519_PKCS8_PREFIX);
    der.extend_from_slice(seed);
    der
}

/// Raw Ed25519 public key carried by a DER certificate.
pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key: &[u8] = &cert.public_key().subject_public_key.data;
    key.try_into().ok()
}

/// Identity proven by the peer's TLS certificate, if any.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    let public_key = extract_public_key_from_cert(certs.first()?.as_ref())?;
    Some(Identity::from_bytes(public_key))
}

/// Encode an identity as a server name: two 32-char hex labels, since a DNS
/// label cannot exceed 63 characters.
pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    let mut labels = sni.split('.');
    let (high, low) = (labels.next()?, labels.next()?);
    if labels.next().is_some() || high.len() != 32 || low.len() != 32 {
        return None;
    }
    Identity::from_hex(&format!("{}{}", high, low)).ok()
}

// ============================================================================
// QUIC Configs
// ============================================================================

fn transport_config(config: &EndpointConfig) -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    let idle = IdleTimeout::try_from(config.idle_timeout)
        .context("idle timeout out of range for QUIC")?;
    transport.max_idle_timeout(Some(idle));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    // Keep-alives well inside the idle window so an idle control stream
    // is not mistaken for a dead peer.
    transport.keep_alive_interval(Some(config.idle_timeout / 3));
    Ok(Arc::new(transport))
}

pub fn create_server_config(tls: &TlsIdentity, config: &EndpointConfig) -> Result<ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_client_cert_verifier(Arc::new(PinnedKeyVerifier::new()))
        .with_single_cert(tls.chain(), tls.key.clone_key())
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
        .context("failed to create QUIC server config")?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(transport_config(config)?);
    Ok(server_config)
}

pub fn create_client_config(tls: &TlsIdentity, config: &EndpointConfig) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedKeyVerifier::new()))
        .with_client_auth_cert(tls.chain(), tls.key.clone_key())
        .context("failed to create client TLS config")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
        .context("failed to create QUIC client config")?;
    let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(transport_config(config)?);
    Ok(client_config)
}

// ============================================================================
// Verification
// ============================================================================

/// Verifies peer certificates by the Ed25519 key they carry.
///
/// As a client verifier it accepts any well-formed key: the listener learns
/// who dialed from the certificate afterwards. As a server verifier it
/// requires the key named by the SNI the dialer chose.
#[derive(Debug)]
struct PinnedKeyVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedKeyVerifier {
    fn new() -> Self {
        Self {
            algorithms: CRYPTO_PROVIDER.signature_verification_algorithms,
        }
    }

    fn certificate_identity(end_entity: &CertificateDer<'_>) -> Result<Identity, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        let identity = Identity::from_bytes(public_key);
        if !identity.is_valid() {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(identity)
    }

    fn tls12(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }
}

impl ClientCertVerifier for PinnedKeyVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Self::certificate_identity(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl ServerCertVerifier for PinnedKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let ServerName::DnsName(name) = server_name else {
            return Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName));
        };
        let expected = parse_identity_from_sni(name.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))?;

        // SECURITY: the key is the identity; any other key is a different node.
        if Self::certificate_identity(end_entity)? != expected {
            return Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}
