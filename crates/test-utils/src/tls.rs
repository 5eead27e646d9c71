use std::sync::Arc;

use anyhow::Context as _;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

/// Acceptor with a throw-away self-signed certificate, and the certificate's SubjectPublicKey.
pub(crate) fn acceptor() -> anyhow::Result<(TlsAcceptor, Vec<u8>)> {
    use x509_cert::der::Decode as _;

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).context("generate certificate")?;

    let public_key = x509_cert::Certificate::from_der(cert.der())
        .context("parse generated certificate")?
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .context("unaligned subject public key")?
        .to_vec();

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .context("build TLS config")?;

    Ok((TlsAcceptor::from(Arc::new(tls_config)), public_key))
}
