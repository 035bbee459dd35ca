//! Tunnel supervision hooks.
//!
//! The tunnel-cluster monitor itself is a separate domain; the core needs
//! its pause/resume guard (config updates must not race tunnel repair) and
//! the any-tunnel-up gate used after port changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use edgelink_activity::Shell;
use edgelink_store::PonySection;

use crate::error::{ControlError, Result};

/// Pause/resume guard over the tunnel monitor.
#[derive(Debug, Default)]
pub struct TunnelMonitor {
    paused: AtomicBool,
}

impl TunnelMonitor {
    /// Create the guard, unpaused.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Suspend tunnel repair.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::debug!("tunnel monitor paused");
    }

    /// Resume tunnel repair.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::debug!("tunnel monitor resumed");
    }

    /// True while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Options of one ping probe run.
#[derive(Debug, Clone, Copy)]
pub struct PingOptions {
    /// Probe attempts before giving up.
    pub attempts: u32,
    /// Per-attempt deadline.
    pub threshold: Duration,
    /// Stop probing after the first success.
    pub interrupt_on_success: bool,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            attempts: 30,
            threshold: Duration::from_secs(5),
            interrupt_on_success: true,
        }
    }
}

/// ICMP reachability probe.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// True when the address answered within the options' limits.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe could not run at all.
    async fn ping(&self, addr: &str, options: PingOptions) -> Result<bool>;
}

/// Pinger shelling out to the system `ping`.
pub struct ShellPinger {
    shell: Arc<dyn Shell>,
}

impl ShellPinger {
    /// Create the pinger.
    #[must_use]
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl Pinger for ShellPinger {
    async fn ping(&self, addr: &str, options: PingOptions) -> Result<bool> {
        let wait = options.threshold.as_secs().max(1);
        let mut last_succeeded = false;
        for _ in 0..options.attempts {
            let command = format!("ping -c 1 -W {wait} {addr}");
            last_succeeded = self.shell.exec(&command).await.is_ok();
            if last_succeeded && options.interrupt_on_success {
                return Ok(true);
            }
        }
        Ok(last_succeeded)
    }
}

/// Wait until any uplink of the first cluster answers, up to `deadline`.
///
/// # Errors
///
/// Returns [`ControlError::TunnelsDown`] when no tunnel answered in time.
pub async fn check_hub_tunnels(
    pinger: &Arc<dyn Pinger>,
    pony: &PonySection,
    deadline: Duration,
) -> Result<()> {
    let Some(cluster) = pony.clusters.first() else {
        return Ok(());
    };

    let (alive_tx, mut alive_rx) = mpsc::channel::<String>(cluster.uplinks.len().max(1));
    for uplink in &cluster.uplinks {
        let addr = uplink.monitor_addr.clone();
        let pinger = Arc::clone(pinger);
        let alive_tx = alive_tx.clone();
        let network = cluster.network.clone();

        tokio::spawn(async move {
            tracing::info!(tunnel = %addr, cluster = %network, "checking tunnel availability");
            match pinger.ping(&addr, PingOptions::default()).await {
                Ok(true) => {
                    let _ = alive_tx.send(addr).await;
                }
                Ok(false) => {
                    tracing::warn!(tunnel = %addr, "tunnel address not available");
                }
                Err(e) => {
                    tracing::warn!(tunnel = %addr, error = %e, "tunnel probe failed");
                }
            }
        });
    }
    drop(alive_tx);

    match tokio::time::timeout(deadline, alive_rx.recv()).await {
        Ok(Some(addr)) => {
            tracing::info!(tunnel = %addr, "tunnel address active");
            Ok(())
        }
        Ok(None) | Err(_) => Err(ControlError::TunnelsDown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelink_store::{TunnelCluster, Uplink};

    struct TablePinger {
        alive: Vec<&'static str>,
    }

    #[async_trait]
    impl Pinger for TablePinger {
        async fn ping(&self, addr: &str, _options: PingOptions) -> Result<bool> {
            Ok(self.alive.contains(&addr))
        }
    }

    fn pony(addrs: &[&str]) -> PonySection {
        PonySection {
            clusters: vec![TunnelCluster {
                network: "10.1.0.0/24".into(),
                uplinks: addrs
                    .iter()
                    .map(|addr| Uplink {
                        name: format!("wg-{addr}"),
                        monitor_addr: (*addr).to_string(),
                    })
                    .collect(),
            }],
        }
    }

    #[tokio::test]
    async fn any_alive_uplink_passes() {
        let pinger: Arc<dyn Pinger> = Arc::new(TablePinger {
            alive: vec!["10.1.0.2"],
        });
        check_hub_tunnels(
            &pinger,
            &pony(&["10.1.0.1", "10.1.0.2"]),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn all_dead_uplinks_time_out() {
        let pinger: Arc<dyn Pinger> = Arc::new(TablePinger { alive: vec![] });
        let err = check_hub_tunnels(
            &pinger,
            &pony(&["10.1.0.1", "10.1.0.2"]),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ControlError::TunnelsDown));
    }

    #[tokio::test]
    async fn empty_cluster_list_passes() {
        let pinger: Arc<dyn Pinger> = Arc::new(TablePinger { alive: vec![] });
        check_hub_tunnels(&pinger, &PonySection::default(), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[test]
    fn pause_resume_round_trip() {
        let monitor = TunnelMonitor::new();
        assert!(!monitor.is_paused());
        monitor.pause();
        assert!(monitor.is_paused());
        monitor.resume();
        assert!(!monitor.is_paused());
    }
}
