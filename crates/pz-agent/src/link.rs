//! Network link: bring up IP connectivity and watch it.
//!
//! The radio itself sits behind `LinkDriver`. On the gateway board that is
//! the WiFi station driver; the host build uses `TcpProbeDriver`, which
//! treats the link as up while the broker address is reachable.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::watch;

use pz_mqtt_channel::Backoff;

use crate::error::NetworkError;

/// WiFi credentials and the DHCP hostname. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

/// Timing for link attempts.
#[derive(Debug, Clone, Copy)]
pub struct LinkPolicy {
    /// Upper bound on a single attempt or probe.
    pub attempt_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

/// Proof of a successful connect.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub hostname: String,
    pub attempts: u32,
    pub connected_at: DateTime<Utc>,
}

#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Join the network with the given credentials.
    async fn associate(&self, credentials: &NetworkCredentials) -> Result<(), NetworkError>;

    /// Whether the link is currently usable.
    async fn is_associated(&self) -> bool;
}

pub struct NetworkLink<D: LinkDriver> {
    driver: D,
    policy: LinkPolicy,
    status: watch::Sender<LinkStatus>,
}

impl<D: LinkDriver> NetworkLink<D> {
    pub fn new(driver: D, policy: LinkPolicy) -> Self {
        let (status, _) = watch::channel(LinkStatus::Down);
        Self {
            driver,
            policy,
            status,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, status: LinkStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            match status {
                LinkStatus::Up => tracing::info!("network link up"),
                LinkStatus::Down => tracing::warn!("network link down"),
            }
        }
    }

    /// One bounded connect attempt.
    pub async fn connect(&self, credentials: &NetworkCredentials) -> Result<LinkHandle, NetworkError> {
        tracing::debug!(ssid = %credentials.ssid, hostname = %credentials.hostname, "joining network");
        let attempt = tokio::time::timeout(
            self.policy.attempt_timeout,
            self.driver.associate(credentials),
        )
        .await;

        match attempt {
            Ok(Ok(())) => {
                self.set_status(LinkStatus::Up);
                Ok(LinkHandle {
                    hostname: credentials.hostname.clone(),
                    attempts: 1,
                    connected_at: Utc::now(),
                })
            }
            Ok(Err(e)) => {
                self.set_status(LinkStatus::Down);
                Err(e)
            }
            Err(_) => {
                self.set_status(LinkStatus::Down);
                Err(NetworkError::Timeout(self.policy.attempt_timeout))
            }
        }
    }

    /// Connect, retrying with capped exponential backoff.
    ///
    /// `max_attempts` of `None` retries until the link comes up; each
    /// attempt is still bounded by the policy timeout.
    pub async fn connect_with_retry(
        &self,
        credentials: &NetworkCredentials,
        max_attempts: Option<u32>,
    ) -> Result<LinkHandle, NetworkError> {
        let mut backoff = Backoff::new(self.policy.retry_initial, self.policy.retry_max);
        loop {
            match self.connect(credentials).await {
                Ok(mut handle) => {
                    handle.attempts = backoff.attempts() + 1;
                    return Ok(handle);
                }
                Err(e) => {
                    let attempts = backoff.attempts() + 1;
                    if max_attempts.is_some_and(|max| attempts >= max) {
                        tracing::error!(attempts, error = %e, "network link attempts exhausted");
                        return Err(NetworkError::RetriesExhausted(attempts));
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        attempt = attempts,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "network link attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Re-probe the driver and publish the result.
    pub async fn refresh(&self) -> LinkStatus {
        let up = tokio::time::timeout(self.policy.attempt_timeout, self.driver.is_associated())
            .await
            .unwrap_or(false);
        let status = if up { LinkStatus::Up } else { LinkStatus::Down };
        self.set_status(status);
        status
    }

    /// Record a loss reported from elsewhere (e.g. a socket error).
    pub fn mark_down(&self) {
        self.set_status(LinkStatus::Down);
    }

    /// Keep the link up: probe every `check_interval` and reconnect with
    /// backoff after a loss.
    ///
    /// This function runs forever until the task is cancelled.
    pub async fn supervise(&self, credentials: &NetworkCredentials, check_interval: Duration) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.refresh().await == LinkStatus::Up {
                continue;
            }
            match self.connect_with_retry(credentials, None).await {
                Ok(handle) => tracing::info!(attempts = handle.attempts, "network link restored"),
                Err(e) => tracing::error!(error = %e, "network link recovery failed"),
            }
        }
    }
}

// ── TcpProbeDriver ────────────────────────────────────────────

/// Host-side link driver: the link is up while the broker accepts TCP.
pub struct TcpProbeDriver {
    target: String,
}

impl TcpProbeDriver {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{host}:{port}"),
        }
    }

    async fn probe(&self) -> Result<(), NetworkError> {
        TcpStream::connect(&self.target)
            .await
            .map(drop)
            .map_err(|e| NetworkError::Io(format!("{}: {e}", self.target)))
    }
}

#[async_trait]
impl LinkDriver for TcpProbeDriver {
    async fn associate(&self, credentials: &NetworkCredentials) -> Result<(), NetworkError> {
        tracing::debug!(
            ssid = %credentials.ssid,
            target = %self.target,
            "host build: probing broker instead of joining WiFi"
        );
        self.probe().await
    }

    async fn is_associated(&self) -> bool {
        self.probe().await.is_ok()
    }
}

// ── MockLinkDriver ────────────────────────────────────────────

/// Scripted outcome for one `associate` call.
#[derive(Debug, Clone)]
pub enum MockAttempt {
    Succeed,
    Fail(NetworkError),
    /// Never completes; exercises the attempt timeout.
    Hang,
}

/// Scriptable driver for tests. Unscripted attempts succeed.
pub struct MockLinkDriver {
    script: Mutex<VecDeque<MockAttempt>>,
    associated: AtomicBool,
    attempts: AtomicUsize,
}

impl MockLinkDriver {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            associated: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_script(script: impl IntoIterator<Item = MockAttempt>) -> Self {
        let driver = Self::new();
        driver
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(script);
        driver
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Simulate the access point dropping or returning.
    pub fn set_associated(&self, up: bool) {
        self.associated.store(up, Ordering::SeqCst);
    }
}

impl Default for MockLinkDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkDriver for MockLinkDriver {
    async fn associate(&self, _credentials: &NetworkCredentials) -> Result<(), NetworkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(MockAttempt::Succeed);
        match next {
            MockAttempt::Succeed => {
                self.associated.store(true, Ordering::SeqCst);
                Ok(())
            }
            MockAttempt::Fail(e) => Err(e),
            MockAttempt::Hang => std::future::pending().await,
        }
    }

    async fn is_associated(&self) -> bool {
        self.associated.load(Ordering::SeqCst)
    }
}
