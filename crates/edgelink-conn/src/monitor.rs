//! Discovery monitor.
//!
//! Polls discovery on an interval and tears the websocket down when the
//! orchestrator topology moved under the agent: a split-brain result always
//! forces a reconnect, and so does a primary that differs from the host the
//! publisher is bound to.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use edgelink_config::ConfigService;

use crate::discovery::DiscoveryService;
use crate::error::ConnError;
use crate::publisher::Publisher;

const MONITOR_INTERVAL: Duration = Duration::from_secs(20);

/// The publisher surface the monitor drives.
pub trait ReconnectSignal: Send + Sync {
    /// Tear down the live connection.
    fn reconnect(&self);
    /// True while the websocket is connected.
    fn is_active(&self) -> bool;
}

impl ReconnectSignal for Publisher {
    fn reconnect(&self) {
        Self::reconnect(self);
    }

    fn is_active(&self) -> bool {
        Self::is_active(self)
    }
}

/// Periodic primary re-probe with reconnect side effects.
pub struct DiscoveryMonitor {
    publisher: Arc<dyn ReconnectSignal>,
    config: Arc<ConfigService>,
    discovery: Arc<DiscoveryService>,
    interval: Duration,
}

impl DiscoveryMonitor {
    /// Create the monitor with the default 20 s interval.
    #[must_use]
    pub fn new(
        publisher: Arc<dyn ReconnectSignal>,
        config: Arc<ConfigService>,
        discovery: Arc<DiscoveryService>,
    ) -> Self {
        Self {
            publisher,
            config,
            discovery,
            interval: MONITOR_INTERVAL,
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so a fresh start waits
        // one full interval before probing
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    /// One monitor round.
    pub async fn poll(&self) {
        let config = match self.config.get_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "discovery monitor: read config failed");
                return;
            }
        };

        let active_addr = config
            .app
            .map(|app| app.active_orchestrator_addr)
            .unwrap_or_default();
        if active_addr.is_empty() {
            tracing::debug!("discovery monitor: no active orchestrator");
            return;
        }

        let hosts = self.discovery.hosts();
        if hosts.is_empty() {
            tracing::debug!("discovery monitor: no hosts");
            return;
        }

        match self.discovery.fetch_primary(&hosts).await {
            Ok(primary) => {
                if primary != active_addr && self.publisher.is_active() {
                    tracing::info!(
                        active = %active_addr,
                        primary = %primary,
                        "primary moved, reconnecting"
                    );
                    self.publisher.reconnect();
                }
            }
            Err(ConnError::SplitBrain) => {
                tracing::error!("discovery monitor: split-brain detected");
                self.publisher.reconnect();
            }
            Err(e) => {
                tracing::error!(error = %e, "discovery monitor: fetch primary failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::discovery::ProbeClient;
    use crate::error::Result;
    use edgelink_activity::{ActivityService, ServiceOptions};
    use edgelink_store::{AppSection, DeviceConfig, RocksStore, Store};
    use tempfile::TempDir;

    struct FakePublisher {
        active: bool,
        reconnects: AtomicUsize,
    }

    impl ReconnectSignal for FakePublisher {
        fn reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    struct ScriptedProbe {
        primaries: Mutex<Vec<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ProbeClient for ScriptedProbe {
        async fn check_primary(&self, host: &str) -> Result<bool> {
            let primaries = self.primaries.lock();
            let current = primaries.first().cloned().unwrap_or_default();
            Ok(current.iter().any(|primary| host.ends_with(primary)))
        }
    }

    async fn monitor_with(
        active_addr: &str,
        primaries: Vec<&'static str>,
        publisher_active: bool,
    ) -> (DiscoveryMonitor, Arc<FakePublisher>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let activity = Arc::new(
            ActivityService::new(Arc::clone(&store), vec![], ServiceOptions::default()).unwrap(),
        );
        let config = Arc::new(ConfigService::new(store, activity, vec![]));

        let partial = DeviceConfig {
            app: Some(AppSection {
                serial_number: "SN1".into(),
                orchestrator_addrs: vec!["https://a".into(), "https://b".into()],
                active_orchestrator_addr: active_addr.into(),
                ..AppSection::default()
            }),
            ..DeviceConfig::default()
        };
        config.update_config(&partial).await.unwrap();

        let discovery = Arc::new(DiscoveryService::new(Arc::new(ScriptedProbe {
            primaries: Mutex::new(vec![primaries]),
        })));
        // seed the host list the way the dialer does
        let _ = discovery
            .fetch_primary(&["https://a".into(), "https://b".into()])
            .await;

        let publisher = Arc::new(FakePublisher {
            active: publisher_active,
            reconnects: AtomicUsize::new(0),
        });
        let monitor = DiscoveryMonitor::new(
            Arc::clone(&publisher) as Arc<dyn ReconnectSignal>,
            config,
            discovery,
        );
        (monitor, publisher, dir)
    }

    #[tokio::test]
    async fn split_brain_triggers_reconnect() {
        let (monitor, publisher, _dir) = monitor_with("https://a", vec!["a", "b"], true).await;
        monitor.poll().await;
        assert_eq!(publisher.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn moved_primary_triggers_reconnect_when_active() {
        let (monitor, publisher, _dir) = monitor_with("https://a", vec!["b"], true).await;
        monitor.poll().await;
        assert_eq!(publisher.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn moved_primary_is_ignored_while_inactive() {
        let (monitor, publisher, _dir) = monitor_with("https://a", vec!["b"], false).await;
        monitor.poll().await;
        assert_eq!(publisher.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stable_primary_does_nothing() {
        let (monitor, publisher, _dir) = monitor_with("https://a", vec!["a"], true).await;
        monitor.poll().await;
        assert_eq!(publisher.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_active_orchestrator_skips_the_round() {
        let (monitor, publisher, _dir) = monitor_with("", vec!["a"], true).await;
        monitor.poll().await;
        assert_eq!(publisher.reconnects.load(Ordering::SeqCst), 0);
    }
}
