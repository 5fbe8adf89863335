use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Certificate locations for the TLS listener and outbound connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Trust anchors for outbound connections
    pub ca_path: Option<PathBuf>,
}

impl TlsSettings {
    pub fn server_config(&self) -> Result<Option<Arc<ServerConfig>>> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_private_key(key)?;
                build_server_config(certs, key).map(Some)
            }
            (None, None) => Ok(None),
            _ => Err(Error::InvalidConfig(
                "cert_path and key_path must be set together".to_string(),
            )),
        }
    }

    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let anchors = match &self.ca_path {
            Some(path) => load_certs(path)?,
            None => Vec::new(),
        };
        build_client_config(anchors)
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        Error::TlsCertificateError(format!("cannot open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = parse_certs(&mut open(path)?)?;
    if certs.is_empty() {
        return Err(Error::TlsCertificateError(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    parse_private_key(&mut open(path)?)?.ok_or_else(|| {
        Error::TlsCertificateError(format!("no private key found in {}", path.display()))
    })
}

fn parse_certs(reader: &mut dyn std::io::BufRead) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsCertificateError(e.to_string()))
}

fn parse_private_key(reader: &mut dyn std::io::BufRead) -> Result<Option<PrivateKeyDer<'static>>> {
    rustls_pemfile::private_key(reader).map_err(|e| Error::TlsCertificateError(e.to_string()))
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn build_client_config(anchors: Vec<CertificateDer<'static>>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in anchors {
        roots.add(cert)?;
    }
    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Server config from in-memory PEM
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = parse_certs(&mut &cert_pem[..])?;
    if certs.is_empty() {
        return Err(Error::TlsCertificateError("no certificates in PEM".to_string()));
    }
    let key = parse_private_key(&mut &key_pem[..])?
        .ok_or_else(|| Error::TlsCertificateError("no private key in PEM".to_string()))?;
    build_server_config(certs, key)
}

/// Client config trusting the certificates in `ca_pem`
pub fn client_config_from_pem(ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let anchors = match ca_pem {
        Some(pem) => parse_certs(&mut &pem[..])?,
        None => Vec::new(),
    };
    build_client_config(anchors)
}
