//! gRPC TLS identity check.
//!
//! Before a node's TLS key is written out it is turned into a
//! `rustls::ServerConfig`, the same shape the node's gRPC endpoint uses.
//! This rejects key material the TLS stack would refuse at startup.
//!
//! Enforces:
//! - TLS 1.3 only
//! - Ring crypto provider
//! - `h2` ALPN (gRPC)

use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{KeyError, Result};
use crate::identity::{KeyRole, NodeKey};

/// ALPN protocol identifier for gRPC over HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// Build a `rustls::ServerConfig` presenting `key` as the server identity.
pub fn server_identity(key: &NodeKey) -> Result<rustls::ServerConfig> {
    if key.role() != KeyRole::Tls {
        return Err(KeyError::TlsIdentity(format!(
            "{} key cannot serve as a TLS identity",
            key.role()
        )));
    }

    let cert_chain = vec![CertificateDer::from(key.certificate().der().to_vec())];
    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_key_der()));

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| KeyError::TlsIdentity(format!("TLS version config: {e}")))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, private_key)
    .map_err(|e| KeyError::TlsIdentity(format!("server cert config: {e}")))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}
