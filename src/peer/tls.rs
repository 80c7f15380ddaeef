//! Mutual-TLS configuration for the peer channel.
//!
//! The shared-secret handshake authenticates peers at the protocol level;
//! this module adds transport encryption with certificate verification in
//! both directions. Both appliances present a certificate signed by the
//! cluster CA, so a host on the sync network cannot read or join the
//! channel with a stolen secret alone.
//!
//! # Example
//!
//! ```rust,ignore
//! use carpaccio::peer::tls::PeerTlsConfig;
//!
//! let tls = PeerTlsConfig::from_pem_files(
//!     "node.crt",
//!     "node.key",
//!     "cluster-ca.crt",
//! )?;
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// TLS material for both directions of the peer channel.
#[derive(Clone)]
pub struct PeerTlsConfig {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl PeerTlsConfig {
    /// Build mutual-TLS configuration from PEM files.
    ///
    /// # Arguments
    ///
    /// * `cert_path` - This node's certificate (chain allowed)
    /// * `key_path` - This node's private key
    /// * `ca_cert_path` - The cluster CA used to verify the peer, both as
    ///   server and as client
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P, ca_cert_path: P) -> Result<Self> {
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        let ca_certs = load_certs(ca_cert_path.as_ref())?;

        let mut root_store = RootCertStore::empty();
        for cert in ca_certs {
            root_store
                .add(cert)
                .map_err(|e| Error::MissingData(format!("Invalid CA certificate: {}", e)))?;
        }
        let root_store = Arc::new(root_store);

        let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::clone(&root_store))
            .build()
            .map_err(|e| Error::MissingData(format!("Failed to build client verifier: {}", e)))?;

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| Error::MissingData(format!("TLS configuration error: {}", e)))?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(Arc::clone(&root_store))
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::MissingData(format!("TLS configuration error: {}", e)))?;

        Ok(PeerTlsConfig {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Acceptor for inbound peer connections.
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Connector for dialing peers.
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::MissingData(format!("Failed to open certificate file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::MissingData(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(Error::MissingData(format!(
            "No certificates found in {:?}",
            path
        )));
    }

    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::MissingData(format!("Failed to open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::MissingData(format!("Failed to parse key file: {}", e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            None => break,
            _ => continue,
        }
    }

    Err(Error::MissingData(format!(
        "No private key found in {:?}",
        path
    )))
}
