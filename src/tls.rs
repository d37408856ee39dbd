//! rustls configuration for the broker and agent binaries.

use std::{fs, io, path::Path, sync::Arc};

use n0_error::{anyerr, Result, StackResultExt, StdResultExt};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore, ServerConfig,
};

/// Installs the ring crypto provider once; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Broker TLS config: terminates h2 and http/1.1 with the given
/// certificate chain and key.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    install_crypto_provider();
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .std_context("invalid certificate or key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Agent TLS config: webpki roots plus an optional extra CA for
/// privately issued broker certificates.
pub fn client_config(extra_ca: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = extra_ca {
        for cert in load_certs(path)? {
            roots.add(cert).std_context("invalid ca certificate")?;
        }
    }
    Ok(Arc::new(client_config_with_roots(roots)))
}

/// Client config trusting exactly the given roots.
pub fn client_config_with_roots(roots: RootCertStore) -> ClientConfig {
    install_crypto_provider();
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .std_context(format!("reading certificate file {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<io::Result<Vec<_>>>()
        .std_context("parsing pem certificates")?;
    if certs.is_empty() {
        return Err(anyerr!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).std_context(format!("reading key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .std_context("parsing pem private key")?
        .context("no private key found")
}
