//! TLS identity loading.
//!
//! Every configured certificate/key pair becomes one identity. During the
//! handshake the identity is picked by the client's SNI name, falling back to
//! the first pair when the client sends no name or nothing matches.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::SupportedProtocolVersion;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::server::config::{TlsKeyPair, TlsSettings, TlsVersion};
use crate::server::error::{ServerError, ServerResult};

/// Builds the acceptor used to wrap accepted sockets.
pub fn build_acceptor(settings: &TlsSettings) -> ServerResult<TlsAcceptor> {
    if settings.key_pairs.is_empty() {
        return Err(ServerError::NoTlsKeys);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let keys = settings
        .key_pairs
        .iter()
        .map(|pair| load_key_pair(pair, &provider))
        .collect::<ServerResult<Vec<_>>>()?;

    let versions = protocol_versions(settings.min_version);
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver { keys }));

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Versions offered for a configured minimum.
///
/// TLS 1.0 and 1.1 are not implemented by the TLS stack; asking for them
/// behaves like asking for 1.2.
fn protocol_versions(min: Option<TlsVersion>) -> Vec<&'static SupportedProtocolVersion> {
    let min = match min {
        Some(version @ (TlsVersion::Tls10 | TlsVersion::Tls11)) => {
            warn!("minimum {} is not supported, using TLS 1.2", version);
            TlsVersion::Tls12
        }
        Some(version) => version,
        None => TlsVersion::Tls12,
    };

    let mut versions = vec![&rustls::version::TLS13];
    if min <= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    versions
}

fn load_key_pair(pair: &TlsKeyPair, provider: &CryptoProvider) -> ServerResult<Arc<CertifiedKey>> {
    let fail = |reason: String| ServerError::TlsKeyPair {
        cert: pair.cert_file.clone(),
        key: pair.key_file.clone(),
        reason,
    };

    let certs = read_certs(&pair.cert_file).map_err(fail)?;
    let key = read_private_key(&pair.key_file).map_err(fail)?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| fail(e.to_string()))?;

    debug!(
        cert = %pair.cert_file.display(),
        chain_len = certs.len(),
        "loaded TLS key pair"
    );
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?;

    if certs.is_empty() {
        return Err(format!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| format!("cannot parse {}: {}", path.display(), e))?
        .ok_or_else(|| format!("no private key found in {}", path.display()))
}

/// Picks the identity whose certificate is valid for the SNI name.
#[derive(Debug)]
struct SniResolver {
    keys: Vec<Arc<CertifiedKey>>,
}

impl SniResolver {
    fn find(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let server_name = ServerName::try_from(name).ok()?;
        self.keys
            .iter()
            .find(|key| {
                key.end_entity_cert()
                    .ok()
                    .and_then(|der| webpki::EndEntityCert::try_from(der).ok())
                    .is_some_and(|cert| cert.verify_is_valid_for_subject_name(&server_name).is_ok())
            })
            .cloned()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.find(name))
            .or_else(|| self.keys.first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Writes a self-signed certificate for `names` and returns its key pair paths.
    fn write_pair(dir: &TempDir, stem: &str, names: &[&str]) -> TlsKeyPair {
        let generated =
            rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert_file = dir.path().join(format!("{}.pem", stem));
        let key_file = dir.path().join(format!("{}.key", stem));
        std::fs::write(&cert_file, generated.cert.pem()).unwrap();
        std::fs::write(&key_file, generated.key_pair.serialize_pem()).unwrap();
        TlsKeyPair::new(cert_file, key_file)
    }

    #[test]
    fn test_no_key_pairs() {
        let settings = TlsSettings::with_key_pairs(vec![]);
        let Err(err) = build_acceptor(&settings) else {
            panic!("acceptor built without key pairs");
        };
        assert!(matches!(err, ServerError::NoTlsKeys));
        assert_eq!(err.to_string(), "no ssl keys configured");
    }

    #[test]
    fn test_missing_files() {
        let settings = TlsSettings::with_key_pairs(vec![TlsKeyPair::new(
            "/nonexistent/cert.pem",
            "/nonexistent/key.pem",
        )]);
        let Err(ServerError::TlsKeyPair { cert, key, .. }) = build_acceptor(&settings) else {
            panic!("expected TlsKeyPair error");
        };
        assert_eq!(cert, PathBuf::from("/nonexistent/cert.pem"));
        assert_eq!(key, PathBuf::from("/nonexistent/key.pem"));
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let pair = write_pair(&dir, "good", &["localhost"]);
        // A key file holds no certificates
        let swapped = TlsKeyPair::new(pair.key_file.clone(), pair.key_file.clone());

        let Err(err) = build_acceptor(&TlsSettings::with_key_pairs(vec![swapped])) else {
            panic!("acceptor built from a key file as certificate");
        };
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn test_build_acceptor() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TlsSettings::with_key_pairs(vec![
            write_pair(&dir, "a", &["localhost"]),
            write_pair(&dir, "b", &["db.example.com"]),
        ])
        .with_min_version(TlsVersion::Tls13);

        assert!(build_acceptor(&settings).is_ok());
    }

    #[test]
    fn test_resolver_matches_sni() {
        let dir = tempfile::tempdir().unwrap();
        let provider = rustls::crypto::ring::default_provider();
        let alpha = load_key_pair(&write_pair(&dir, "alpha", &["alpha.test"]), &provider).unwrap();
        let beta = load_key_pair(&write_pair(&dir, "beta", &["beta.test"]), &provider).unwrap();
        let resolver = SniResolver {
            keys: vec![alpha.clone(), beta.clone()],
        };

        assert!(Arc::ptr_eq(&resolver.find("beta.test").unwrap(), &beta));
        assert!(Arc::ptr_eq(&resolver.find("alpha.test").unwrap(), &alpha));
        assert!(resolver.find("gamma.test").is_none());
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(protocol_versions(None).len(), 2);
        assert_eq!(protocol_versions(Some(TlsVersion::Tls10)).len(), 2);
        assert_eq!(protocol_versions(Some(TlsVersion::Tls12)).len(), 2);

        let only_13 = protocol_versions(Some(TlsVersion::Tls13));
        assert_eq!(only_13.len(), 1);
        assert_eq!(only_13[0].version, rustls::ProtocolVersion::TLSv1_3);
    }
}
