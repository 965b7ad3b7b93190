use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::api::Envelope;
use crate::config::DiscoveryConfig;
use crate::error::{BenchError, Result};
use crate::fleet::machine::{AgentDescriptor, Capabilities, PortDescriptor, TestCaseDescriptor};

/// Reachability and capability lookups against one address.
///
/// Implementations must bound every call by a timeout; the registry relies
/// on that to keep one dead address from stalling a sweep.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self, address: &str) -> bool;

    async fn fetch_capabilities(&self, address: &str) -> Result<Capabilities>;
}

/// Probes the agent HTTP endpoint on every machine.
#[derive(Debug, Clone)]
pub struct AgentProbe {
    port: u16,
    connect_timeout: Duration,
    client: reqwest::Client,
}

impl AgentProbe {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .connect_timeout(config.probe_timeout())
            .build()?;
        Ok(Self {
            port: config.agent_port,
            connect_timeout: config.probe_timeout(),
            client,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    fn authority(&self, address: &str) -> String {
        match address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", address, self.port),
        }
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{}{}", self.authority(address), path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, address: &str, path: &str) -> Result<T> {
        let envelope: Envelope<T> = self
            .client
            .get(self.url(address, path))
            .send()
            .await?
            .json()
            .await?;
        envelope.into_result()
    }
}

#[async_trait]
impl NetworkProbe for AgentProbe {
    async fn is_reachable(&self, address: &str) -> bool {
        let target = self.authority(address);
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target)).await,
            Ok(Ok(_))
        )
    }

    async fn fetch_capabilities(&self, address: &str) -> Result<Capabilities> {
        let (info, ports, cases) = tokio::join!(
            self.get::<AgentDescriptor>(address, "/api/info"),
            self.get::<Vec<PortDescriptor>>(address, "/api/ports"),
            self.get::<Vec<TestCaseDescriptor>>(address, "/api/cases"),
        );
        let info = info?;

        // A partial descriptor is still useful; only the host info is required.
        let ports = ports.unwrap_or_else(|e| {
            tracing::warn!(address, error = %e, "Failed to fetch ports");
            Vec::new()
        });
        let cases = cases.unwrap_or_else(|e| {
            tracing::warn!(address, error = %e, "Failed to fetch test cases");
            Vec::new()
        });

        if info.hostname.is_empty() && ports.is_empty() && cases.is_empty() {
            return Err(BenchError::Internal(format!(
                "empty capability descriptor from {}",
                address
            )));
        }
        Ok(Capabilities::from_parts(info, ports, cases))
    }
}
