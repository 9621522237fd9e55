//! Default [`ClientFactory`]: opens a connection to the first reachable bootstrap broker.
//!
//! Kafka protocol exchanges happen above this layer, a handle only owns the established transport.

use super::tls::TlsConnector;
use super::{ClientFactory, ClientHandle};
use crate::properties::{BOOTSTRAP_SERVERS, ClientKind, PropertyMap};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

pub async fn tcp_stream(connect_timeout: Duration, host: &str, port: u16) -> Result<TcpStream> {
    timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            anyhow!(
                "destination {host}:{port} did not respond to connection attempt within {connect_timeout:?}"
            )
        })?
        .with_context(|| format!("Failed to connect to destination {host}:{port}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Address {address:?} must include a ':' separator"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(anyhow!("Address {address:?} must include a host before ':'"));
        }
        Ok(BrokerAddress {
            host: host.to_owned(),
            port: port
                .parse()
                .map_err(|_| anyhow!("Failed to parse port of address {address:?} as integer"))?,
        })
    }

    /// Parses a comma separated `bootstrap.servers` value.
    pub fn parse_list(addresses: &str) -> Result<Vec<Self>> {
        let addresses: Vec<Self> = addresses
            .split(',')
            .filter(|address| !address.trim().is_empty())
            .map(BrokerAddress::parse)
            .collect::<Result<_>>()?;
        if addresses.is_empty() {
            return Err(anyhow!("{BOOTSTRAP_SERVERS} does not list any brokers"));
        }
        Ok(addresses)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A trait object can only consist of one trait + special language traits like Send/Sync etc
/// So we need to use this trait when creating trait objects that need both AsyncRead and AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub struct BrokerClientFactory {
    connect_timeout: Duration,
}

impl BrokerClientFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        BrokerClientFactory { connect_timeout }
    }

    async fn connect(
        &self,
        address: &BrokerAddress,
        tls: &Option<TlsConnector>,
    ) -> Result<Box<dyn AsyncStream>> {
        Ok(match tls {
            Some(tls) => Box::new(
                tls.connect(self.connect_timeout, &address.host, address.port)
                    .await?,
            ),
            None => Box::new(tcp_stream(self.connect_timeout, &address.host, address.port).await?),
        })
    }
}

#[async_trait]
impl ClientFactory for BrokerClientFactory {
    async fn create(
        &self,
        kind: ClientKind,
        properties: &PropertyMap,
    ) -> Result<Arc<dyn ClientHandle>> {
        let bootstrap = properties
            .get(BOOTSTRAP_SERVERS)
            .ok_or_else(|| anyhow!("{BOOTSTRAP_SERVERS} is not configured"))?;
        let addresses = BrokerAddress::parse_list(bootstrap)?;
        let tls = TlsConnector::from_properties(properties)?;

        let mut errors = vec![];
        for address in addresses {
            match self.connect(&address, &tls).await {
                Ok(stream) => {
                    tracing::debug!(%kind, %address, "connected to bootstrap broker");
                    return Ok(Arc::new(BrokerHandle {
                        kind,
                        address,
                        stream: Mutex::new(Some(stream)),
                    }));
                }
                Err(err) => {
                    tracing::warn!(%kind, %address, "failed to connect to bootstrap broker: {err:?}");
                    errors.push(format!("{address}: {err}"));
                }
            }
        }

        Err(anyhow!(
            "No bootstrap broker could be reached\n{}",
            errors.join("\n")
        ))
    }
}

pub struct BrokerHandle {
    kind: ClientKind,
    address: BrokerAddress,
    stream: Mutex<Option<Box<dyn AsyncStream>>>,
}

impl BrokerHandle {
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("kind", &self.kind)
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl ClientHandle for BrokerHandle {
    fn kind(&self) -> ClientKind {
        self.kind
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream
                .shutdown()
                .await
                .with_context(|| format!("Failed to shutdown connection to {}", self.address))?;
        }
        Ok(())
    }
}
