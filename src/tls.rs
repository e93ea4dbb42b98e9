//! TLS and DTLS configuration assembly
//!
//! Certificate acquisition and renewal is an external collaborator; this
//! module only turns `(cert, key, ca)` material into ready-to-use rustls
//! and OpenSSL configurations. The cert-monitor task re-invokes these
//! builders after a renewal and the owning listener swaps the result in via
//! a stop-rebuild-start sequence.

use std::io::BufReader;
use std::sync::Arc;

use derive_more::{Display, Error, From};
use serde_derive::Deserialize;

#[derive(Debug, Display, From, Error)]
pub enum TlsError {
    Io(std::io::Error),
    Tls(rustls::Error),
    OpenSsl(openssl::error::ErrorStack),
    Cert(rcgen::RcgenError),
    Config(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, TlsError>;

/// How a node obtains its certificate. `dns`, `http` and `tls` select the
/// challenge mode of the external provider; `none` (or empty) disables
/// certificate management for the node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(default)]
pub struct CertConfig {
    pub cert_mode: String,
    pub cert_domain: String,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    /// Renewal check interval in minutes.
    pub update_periodic: u64,
}

impl CertConfig {
    /// True when a cert-monitor task must be registered for the node.
    pub fn monitored(&self) -> bool {
        !self.cert_mode.is_empty() && self.cert_mode != "none"
    }

    /// Trigger the external certificate provider, then read back the
    /// material. The provider contract is out of scope; its output are the
    /// configured files.
    pub fn renew(&self) -> Result<CertMaterial> {
        match self.cert_mode.as_str() {
            "dns" | "http" | "tls" => self.load(),
            mode => Err(TlsError::Config(format!("unsupported cert mode '{}'", mode))),
        }
    }

    /// Read the configured certificate files.
    pub fn load(&self) -> Result<CertMaterial> {
        let cert = std::fs::read(&self.cert_file)?;
        let key = std::fs::read(&self.key_file)?;
        let ca = if self.ca_file.is_empty() {
            None
        } else {
            Some(std::fs::read(&self.ca_file)?)
        };
        Ok(CertMaterial { cert, key, ca })
    }
}

/// Raw PEM blobs handed over by the certificate provider.
pub struct CertMaterial {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Option<Vec<u8>>,
}

fn parse_certs(pem: &[u8]) -> Result<Vec<rustls::Certificate>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(TlsError::Config("no certificate in PEM data".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<rustls::PrivateKey> {
    let mut reader = BufReader::new(pem);
    for item in rustls_pemfile::read_all(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(rustls::PrivateKey(key)),
            _ => continue,
        }
    }
    Err(TlsError::Config("no private key in PEM data".to_string()))
}

fn root_store(ca: Option<&[u8]>) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    match ca {
        Some(pem) => {
            for cert in parse_certs(pem)? {
                roots
                    .add(&cert)
                    .map_err(|e| TlsError::Config(format!("bad CA certificate: {}", e)))?;
            }
        }
        None => {
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
        }
    }
    Ok(roots)
}

/// Server-side TLS config, with client certificate verification when
/// `mutual_tls` is set (the CA then validates client certs).
pub fn tls_server_config(material: &CertMaterial, mutual_tls: bool) -> Result<Arc<rustls::ServerConfig>> {
    let certs = parse_certs(&material.cert)?;
    let key = parse_key(&material.key)?;

    let builder = rustls::ServerConfig::builder().with_safe_defaults();
    let config = if mutual_tls {
        let roots = root_store(material.ca.as_deref())?;
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
        builder
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };

    Ok(Arc::new(config))
}

/// Client-side TLS config. A CA file replaces the bundled roots; a client
/// cert/key pair enables mutual TLS.
pub fn tls_client_config(
    ca: Option<&[u8]>,
    client_cert: Option<(&[u8], &[u8])>,
) -> Result<Arc<rustls::ClientConfig>> {
    let roots = root_store(ca)?;
    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    let config = match client_cert {
        Some((cert, key)) => {
            builder.with_client_auth_cert(parse_certs(cert)?, parse_key(key)?)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Self-signed server material for setups without a certificate provider,
/// e.g. tests and local experiments.
pub fn self_signed(hostnames: &[String]) -> Result<CertMaterial> {
    let mut params = rcgen::CertificateParams::new(hostnames.to_vec());
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "RouteDNS");

    let cert = rcgen::Certificate::from_params(params)?;
    Ok(CertMaterial {
        cert: cert.serialize_pem()?.into_bytes(),
        key: cert.serialize_private_key_pem().into_bytes(),
        ca: None,
    })
}

/// DTLS acceptor for the datagram listener; rustls has no DTLS support so
/// this side is built on OpenSSL.
pub fn dtls_server_config(
    material: &CertMaterial,
    mutual_tls: bool,
) -> Result<openssl::ssl::SslAcceptor> {
    use openssl::pkey::PKey;
    use openssl::ssl::{SslAcceptor, SslMethod, SslVerifyMode};
    use openssl::x509::X509;

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::dtls())?;
    let cert = X509::from_pem(&material.cert)?;
    let key = PKey::private_key_from_pem(&material.key)?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;

    if let Some(ca) = &material.ca {
        let ca = X509::from_pem(ca)?;
        builder.cert_store_mut().add_cert(ca)?;
    }
    if mutual_tls {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }

    Ok(builder.build())
}

/// DTLS connector for the upstream client side.
pub fn dtls_client_config(ca: Option<&[u8]>) -> Result<openssl::ssl::SslConnector> {
    use openssl::ssl::{SslConnector, SslMethod};
    use openssl::x509::X509;

    let mut builder = SslConnector::builder(SslMethod::dtls())?;
    if let Some(ca) = ca {
        let ca = X509::from_pem(ca)?;
        builder.cert_store_mut().add_cert(ca)?;
    }
    Ok(builder.build())
}

/// Certificate verifier that accepts anything; only for explicitly
/// configured insecure upstreams and tests.
pub struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Client config that skips verification, for test setups with self-signed
/// server certificates.
pub fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    Arc::new(config)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_self_signed_material_builds_server_config() {
        let material = self_signed(&["localhost".to_string()]).unwrap();
        assert!(tls_server_config(&material, false).is_ok());
    }

    #[test]
    fn test_self_signed_material_builds_dtls_config() {
        let material = self_signed(&["localhost".to_string()]).unwrap();
        assert!(dtls_server_config(&material, false).is_ok());
    }

    #[test]
    fn test_client_config_with_bundled_roots() {
        assert!(tls_client_config(None, None).is_ok());
    }

    #[test]
    fn test_cert_config_monitored() {
        let mut cfg = CertConfig::default();
        assert!(!cfg.monitored());
        cfg.cert_mode = "none".to_string();
        assert!(!cfg.monitored());
        cfg.cert_mode = "dns".to_string();
        assert!(cfg.monitored());
    }
}
