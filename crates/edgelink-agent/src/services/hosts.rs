//! Orchestrator hostname pinning in the hosts file.
//!
//! The agent keeps a generated section of the hosts file in sync with the
//! resolved orchestrator addresses so the control channel survives DNS
//! outages. The sync is idempotent: identical resolver output leaves the
//! file byte-equal.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use edgelink_config::ConfigService;

use crate::error::{ControlError, Result};

const GENERATED_MARKER: &str = "# edgelink: pinned orchestrator hosts";

/// Resolves a host name to addresses.
pub trait Resolver: Send + Sync {
    /// Look the host up.
    ///
    /// # Errors
    ///
    /// Returns an error when resolution fails.
    fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        use std::net::ToSocketAddrs;

        let addrs = format!("{host}:443").to_socket_addrs()?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Keeps the hosts file pinned to the orchestrator addresses.
pub struct HostsSync {
    config: Arc<ConfigService>,
    resolver: Arc<dyn Resolver>,
    hosts_path: PathBuf,
}

impl HostsSync {
    /// Create the service over a hosts file path.
    #[must_use]
    pub fn new(
        config: Arc<ConfigService>,
        resolver: Arc<dyn Resolver>,
        hosts_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            resolver,
            hosts_path: hosts_path.into(),
        }
    }

    /// Refresh the generated section from the configured orchestrators.
    ///
    /// # Errors
    ///
    /// Returns an error when resolution or the file rewrite fails.
    pub fn sync_hosts(&self) -> Result<()> {
        let config = self.config.get_config()?;
        let Some(app) = config.app else {
            return Ok(());
        };
        if app.orchestrator_addrs.is_empty() {
            return Ok(());
        }

        let mut new_lines = Vec::new();
        let mut orchestrator_hosts = HashSet::new();
        for addr in &app.orchestrator_addrs {
            let host = strip_scheme(addr);
            let ips = self
                .resolver
                .lookup(host)
                .map_err(|e| ControlError::Internal(format!("lookup {host}: {e}")))?;
            for ip in ips {
                new_lines.push(format!("{ip} {host}"));
            }
            orchestrator_hosts.insert(host.to_string());
        }

        if new_lines.is_empty() {
            return Ok(());
        }

        let data = std::fs::read_to_string(&self.hosts_path)
            .map_err(|e| ControlError::Internal(format!("read hosts file: {e}")))?;

        let mut preserved = Vec::new();
        let mut existing = HashSet::new();
        for line in data.lines() {
            let line = line.trim();
            if line == GENERATED_MARKER || line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            if let (Some(ip), Some(host)) = (parts.next(), parts.next()) {
                if orchestrator_hosts.contains(host) {
                    existing.insert(format!("{ip} {host}"));
                    continue;
                }
            }

            preserved.push(line.to_string());
        }

        let mut has_changes = existing.len() != new_lines.len();
        if !has_changes {
            let mut leftover = existing.clone();
            for line in &new_lines {
                leftover.remove(line);
            }
            has_changes = !leftover.is_empty();
        }
        if !has_changes {
            return Ok(());
        }

        let mut out = String::new();
        for line in &preserved {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(GENERATED_MARKER);
        out.push('\n');
        for line in &new_lines {
            out.push_str(line);
            out.push('\n');
        }

        std::fs::write(&self.hosts_path, out)
            .map_err(|e| ControlError::Internal(format!("write hosts file: {e}")))?;

        tracing::info!(pinned = new_lines.len(), "hosts file synced");
        Ok(())
    }
}

fn strip_scheme(addr: &str) -> &str {
    addr.trim_start_matches("https://").trim_start_matches("http://")
}
