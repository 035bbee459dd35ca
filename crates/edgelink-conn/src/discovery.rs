//! Primary-orchestrator discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{ConnError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_RETRIES: u32 = 3;
const INSTANCE_STATE_PATH: &str = "/api/v1/dr/instance/state";
const PRIMARY_STATE: &str = "primary";

/// Probes one candidate host for its failover state.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// True when the host reports the `primary` role.
    ///
    /// # Errors
    ///
    /// Returns an error when the host is unreachable or replies with an
    /// error status.
    async fn check_primary(&self, host: &str) -> Result<bool>;
}

#[derive(Deserialize)]
struct InstanceStateBody {
    data: InstanceStateData,
}

#[derive(Deserialize)]
struct InstanceStateData {
    state: String,
}

/// HTTP probe accepting self-signed certificates.
///
/// Devices can switch their transport path to the orchestrator, so every
/// request closes its connection instead of keeping it pooled.
pub struct HttpProbeClient {
    client: reqwest::Client,
}

impl Default for HttpProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProbeClient {
    /// Build the probe client.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }
}

#[async_trait]
impl ProbeClient for HttpProbeClient {
    async fn check_primary(&self, host: &str) -> Result<bool> {
        let url = format!("{host}{INSTANCE_STATE_PATH}");

        let mut last_err = ConnError::Http("no attempt made".to_string());
        for _ in 0..PROBE_RETRIES {
            let response = match self
                .client
                .get(&url)
                .header(reqwest::header::CONNECTION, "close")
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_err = ConnError::Http(e.to_string());
                    continue;
                }
            };

            if !response.status().is_success() {
                last_err = ConnError::Api {
                    host: host.to_string(),
                    status: response.status().as_u16(),
                };
                continue;
            }

            let body: InstanceStateBody = response
                .json()
                .await
                .map_err(|e| ConnError::Http(e.to_string()))?;
            return Ok(body.data.state == PRIMARY_STATE);
        }

        Err(last_err)
    }
}

/// Parallel probe of the candidate list with split-brain detection.
pub struct DiscoveryService {
    probe: Arc<dyn ProbeClient>,
    hosts: Mutex<Vec<String>>,
}

impl DiscoveryService {
    /// Create the service over a probe client.
    #[must_use]
    pub fn new(probe: Arc<dyn ProbeClient>) -> Self {
        Self {
            probe,
            hosts: Mutex::new(Vec::new()),
        }
    }

    /// The candidate list of the most recent probe.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().clone()
    }

    /// Probe every candidate in parallel and pick the unique primary.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::SplitBrain`] when two or more hosts claim the
    /// primary role and [`ConnError::PrimaryNotFound`] when none does.
    pub async fn fetch_primary(&self, hosts: &[String]) -> Result<String> {
        {
            let mut current = self.hosts.lock();
            if *current != hosts {
                *current = hosts.to_vec();
            }
        }

        let probes = hosts.iter().map(|host| {
            let probe = Arc::clone(&self.probe);
            async move { (host.clone(), probe.check_primary(host).await) }
        });

        let mut primary: Option<String> = None;
        for (host, result) in join_all(probes).await {
            match result {
                Ok(true) => {
                    if primary.is_some() {
                        return Err(ConnError::SplitBrain);
                    }
                    primary = Some(host);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "discovery probe failed");
                }
            }
        }

        primary.ok_or(ConnError::PrimaryNotFound)
    }
}
