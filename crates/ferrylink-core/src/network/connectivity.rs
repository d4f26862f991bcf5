//! Connectivity tracking.
//!
//! Provides:
//! - A single-writer, many-reader online flag published on a `watch` channel
//! - Listener notification on the offline→online transition
//! - Following an external reachability signal
//! - Optional active probing with HEAD requests

use crate::config::NetworkConfig;
use crate::network::transport::Transport;
use crate::request::{HttpMethod, Request};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notified when the network becomes available after being offline.
#[async_trait]
pub trait ConnectivityListener: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "listener"
    }

    async fn on_network_restored(&self);
}

/// Configuration for active connectivity probing.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// URLs to probe, in order of preference. Any one answering is enough.
    pub probe_urls: Vec<String>,
    pub probe_timeout: Duration,
    /// How often to re-check connectivity when offline.
    pub offline_recheck_interval: Duration,
    /// How often to verify connectivity when online.
    pub online_verify_interval: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_urls: Vec::new(),
            probe_timeout: NetworkConfig::PROBE_TIMEOUT,
            offline_recheck_interval: NetworkConfig::OFFLINE_RECHECK_INTERVAL,
            online_verify_interval: NetworkConfig::ONLINE_VERIFY_INTERVAL,
        }
    }
}

impl ConnectivityConfig {
    pub fn with_probe_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.probe_urls = urls.into_iter().map(Into::into).collect();
        self
    }
}

/// Tracks whether the device is online.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    listeners: RwLock<Vec<Arc<dyn ConnectivityListener>>>,
    probing_active: AtomicBool,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state,
            listeners: RwLock::new(Vec::new()),
            probing_active: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectivityListener>) {
        debug!("Registered connectivity listener: {}", listener.name());
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Record the current reachability.
    ///
    /// On an offline→online transition every listener is notified on a
    /// spawned task, whose handle is returned. Other transitions only update
    /// the flag.
    pub fn set_online(&self, online: bool) -> Option<JoinHandle<()>> {
        let was_online = self.state.send_replace(online);
        if was_online == online {
            return None;
        }

        if !online {
            warn!("Network connectivity lost");
            return None;
        }

        info!("Network connectivity restored");
        let listeners: Vec<_> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if listeners.is_empty() {
            return None;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available; skipping network-restored notifications");
                return None;
            }
        };

        Some(runtime.spawn(async move {
            let notifications = listeners.iter().map(|listener| async move {
                debug!("Notifying {} of network restoration", listener.name());
                listener.on_network_restored().await;
            });
            futures::future::join_all(notifications).await;
        }))
    }

    /// Follow an external reachability signal until its sender is dropped.
    pub fn attach(self: &Arc<Self>, mut signal: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let initial = *signal.borrow_and_update();
            monitor.set_online(initial);
            while signal.changed().await.is_ok() {
                let online = *signal.borrow_and_update();
                monitor.set_online(online);
            }
            debug!("Reachability signal closed");
        })
    }

    /// Probe the configured URLs once and record the result.
    ///
    /// With no probe URLs configured the current state is left unchanged.
    pub async fn check_connectivity(
        &self,
        transport: &dyn Transport,
        config: &ConnectivityConfig,
    ) -> bool {
        if config.probe_urls.is_empty() {
            return self.is_online();
        }

        for url in &config.probe_urls {
            if probe_url(transport, url, config.probe_timeout).await {
                self.set_online(true);
                return true;
            }
            debug!("Probe failed for {}", url);
        }

        self.set_online(false);
        false
    }

    /// Start background probing.
    pub fn start_probing(self: &Arc<Self>, transport: Arc<dyn Transport>, config: ConnectivityConfig) {
        if self.probing_active.swap(true, Ordering::SeqCst) {
            debug!("Connectivity probing already active");
            return;
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting background connectivity probing");

            while monitor.probing_active.load(Ordering::SeqCst) {
                monitor.check_connectivity(transport.as_ref(), &config).await;

                let interval = if monitor.is_online() {
                    config.online_verify_interval
                } else {
                    config.offline_recheck_interval
                };
                tokio::time::sleep(interval).await;
            }

            info!("Background connectivity probing stopped");
        });
    }

    pub fn stop_probing(&self) {
        self.probing_active.store(false, Ordering::SeqCst);
    }

    pub fn is_probing(&self) -> bool {
        self.probing_active.load(Ordering::SeqCst)
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// HEAD a URL with a short timeout.
///
/// Success, redirects and 403 (rate limiting) all prove the network works.
async fn probe_url(transport: &dyn Transport, url: &str, timeout: Duration) -> bool {
    let request = Request::new(url, HttpMethod::Head);
    match tokio::time::timeout(timeout, transport.send(&request, None)).await {
        Ok(Ok(response)) => {
            let status = response.status;
            (200..400).contains(&status) || status == 403
        }
        Ok(Err(e)) => {
            debug!("Probe request failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Probe of {} timed out", url);
            false
        }
    }
}
