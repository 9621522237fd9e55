//! TLS for broker connections, configured from the kafka `ssl.*` client properties.

use crate::properties::{
    PropertyMap, SSL_ENDPOINT_IDENTIFICATION_ALGORITHM, SSL_TRUSTSTORE_CERTIFICATES,
    SSL_TRUSTSTORE_LOCATION, SSL_TRUSTSTORE_TYPE, tls_enabled,
};
use anyhow::{Context, Result, anyhow, bail};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector as RustlsConnector;
use tokio_rustls::client::TlsStream;

pub const SSL_KEYSTORE_TYPE: &str = "ssl.keystore.type";
pub const SSL_KEYSTORE_CERTIFICATE_CHAIN: &str = "ssl.keystore.certificate.chain";
pub const SSL_KEYSTORE_KEY: &str = "ssl.keystore.key";

#[derive(Clone)]
pub struct TlsConnector {
    connector: RustlsConnector,
}

fn load_certs(pem: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(pem)
        .collect::<Result<Vec<_>, _>>()
        .context("Error while parsing PEM")
}

fn load_private_key(pem: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>> {
    for key in rustls_pemfile::read_all(pem) {
        match key.context("Error while parsing PEM")? {
            Item::Pkcs8Key(x) => return Ok(x.into()),
            Item::Pkcs1Key(x) => return Ok(x.into()),
            Item::Sec1Key(x) => return Ok(x.into()),
            _ => {}
        }
    }
    Err(anyhow!("No suitable keys found in PEM"))
}

/// Builds the trusted root store from the truststore properties.
/// Only PEM truststores are supported, either inline or as a file.
fn load_trust(properties: &PropertyMap) -> Result<RootCertStore> {
    if let Some(store_type) = properties.get(SSL_TRUSTSTORE_TYPE) {
        if !store_type.eq_ignore_ascii_case("PEM") {
            bail!("{SSL_TRUSTSTORE_TYPE} {store_type} is not supported, only PEM truststores can be used");
        }
    }

    let certs = if let Some(pem) = properties.get(SSL_TRUSTSTORE_CERTIFICATES) {
        load_certs(&mut pem.as_bytes())
            .with_context(|| format!("Failed to read certificates configured at '{SSL_TRUSTSTORE_CERTIFICATES}'"))?
    } else if let Some(path) = properties.get(SSL_TRUSTSTORE_LOCATION) {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to read file {path} configured at '{SSL_TRUSTSTORE_LOCATION}'"))?;
        load_certs(&mut std::io::BufReader::new(file))
            .with_context(|| format!("Failed to read file {path} configured at '{SSL_TRUSTSTORE_LOCATION}'"))?
    } else {
        bail!("A secure connection is configured but no truststore is available");
    };

    let mut root_cert_store = RootCertStore::empty();
    for cert in certs {
        root_cert_store
            .add(cert)
            .context("Failed to add cert to cert store")?;
    }
    Ok(root_cert_store)
}

impl TlsConnector {
    /// Returns `None` when the properties do not ask for TLS.
    pub fn from_properties(properties: &PropertyMap) -> Result<Option<TlsConnector>> {
        if !tls_enabled(properties) {
            return Ok(None);
        }

        let root_cert_store = load_trust(properties)?;

        if let Some(store_type) = properties.get(SSL_KEYSTORE_TYPE) {
            if !store_type.eq_ignore_ascii_case("PEM") {
                bail!("{SSL_KEYSTORE_TYPE} {store_type} is not supported, only PEM keystores can be used");
            }
        }
        let private_key = properties
            .get(SSL_KEYSTORE_KEY)
            .map(|pem| {
                load_private_key(&mut pem.as_bytes())
                    .with_context(|| format!("Failed to read key configured at '{SSL_KEYSTORE_KEY}'"))
            })
            .transpose()?;
        let certs = properties
            .get(SSL_KEYSTORE_CERTIFICATE_CHAIN)
            .map(|pem| {
                load_certs(&mut pem.as_bytes()).with_context(|| {
                    format!("Failed to read certificates configured at '{SSL_KEYSTORE_CERTIFICATE_CHAIN}'")
                })
            })
            .transpose()?;

        // kafka disables hostname verification with an empty identification algorithm
        let verify_hostname = properties
            .get(SSL_ENDPOINT_IDENTIFICATION_ALGORITHM)
            .map(|algorithm| !algorithm.is_empty())
            .unwrap_or(true);

        let config_builder = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .context("Failed to configure TLS protocol versions")?;
        let config = match (private_key, certs, verify_hostname) {
            (Some(private_key), Some(certs), true) => config_builder
                .with_root_certificates(root_cert_store)
                .with_client_auth_cert(certs, private_key)?,
            (Some(private_key), Some(certs), false) => config_builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipVerifyHostName::new(
                    root_cert_store,
                )?))
                .with_client_auth_cert(certs, private_key)?,
            (None, None, true) => config_builder
                .with_root_certificates(root_cert_store)
                .with_no_client_auth(),
            (None, None, false) => config_builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipVerifyHostName::new(
                    root_cert_store,
                )?))
                .with_no_client_auth(),
            (Some(_), None, _) => {
                bail!("{SSL_KEYSTORE_KEY} was specified but {SSL_KEYSTORE_CERTIFICATE_CHAIN} was not: Either enable both or none")
            }
            (None, Some(_), _) => {
                bail!("{SSL_KEYSTORE_CERTIFICATE_CHAIN} was specified but {SSL_KEYSTORE_KEY} was not: Either enable both or none")
            }
        };

        Ok(Some(TlsConnector {
            connector: RustlsConnector::from(Arc::new(config)),
        }))
    }

    pub async fn connect(
        &self,
        connect_timeout: Duration,
        host: &str,
        port: u16,
    ) -> Result<TlsStream<TcpStream>> {
        let servername = ServerName::try_from(host.to_owned())
            .with_context(|| format!("{host} is not a valid server name"))?;
        let tcp_stream = super::broker::tcp_stream(connect_timeout, host, port).await?;
        tokio::time::timeout(connect_timeout, self.connector.connect(servername, tcp_stream))
            .await
            .map_err(|_| anyhow!("TLS handshake with {host}:{port} did not complete within {connect_timeout:?}"))?
            .context("Failed to establish TLS connection to destination")
    }
}

#[derive(Debug)]
struct SkipVerifyHostName {
    verifier: Arc<WebPkiServerVerifier>,
}

impl SkipVerifyHostName {
    fn new(roots: RootCertStore) -> Result<Self> {
        Ok(SkipVerifyHostName {
            verifier: WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots),
                Arc::new(default_provider()),
            )
            .build()
                .context("Failed to build certificate verifier")?,
        })
    }
}

// Brokers are often addressed by ip or by an address that their certificate does not name,
// the certificate chain is still verified against the configured trust material.
impl ServerCertVerifier for SkipVerifyHostName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(result) => Ok(result),
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verifier.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verifier.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.verifier.supported_verify_schemes()
    }
}
