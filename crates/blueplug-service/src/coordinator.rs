//! Bridge coordinator.
//!
//! The coordinator task owns the scanner and the session map. For every
//! advertisement it publishes passive sensor payloads, forwards a presence
//! confirmation to an existing session, or admits the device into a new
//! session. Readings produced by sessions are forwarded to the publish bridge.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use blueplug_core::scan::ScanResult;
use blueplug_core::{
    Advertisement, BleAdapter, DecoderRegistry, ReportReceiver, Result, RetryConfig, ScanFilter,
    ScanOptions, ScanStream, Scanner, SessionContext, SessionHandle, SessionOptions,
    SessionReport, report_channel, spawn_session,
};
use blueplug_types::{DeviceIdentity, Reading};

use crate::bridge::{BridgeHandle, BridgeReport};
use crate::config::DeviceConfig;

/// Options for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Options passed to every session.
    pub session: SessionOptions,
    /// Upper bound on concurrent sessions.
    pub max_sessions: usize,
    /// Time sessions get to release their links on shutdown.
    pub shutdown_timeout: Duration,
    /// Scanner filter.
    pub scan_filter: ScanFilter,
    /// Scanner options.
    pub scan_options: ScanOptions,
    /// Backoff for restarting a failed scan.
    pub scan_restart: RetryConfig,
    /// Configured devices, admitted even without a matching service.
    pub devices: Vec<DeviceConfig>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            max_sessions: 8,
            shutdown_timeout: Duration::from_secs(10),
            scan_filter: ScanFilter::new(),
            scan_options: ScanOptions::default(),
            scan_restart: RetryConfig::for_scan(),
            devices: Vec::new(),
        }
    }
}

impl CoordinatorOptions {
    /// Set the session options.
    #[must_use]
    pub fn session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    /// Set the session limit.
    #[must_use]
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the shutdown wait for sessions.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the scanner filter.
    #[must_use]
    pub fn scan_filter(mut self, filter: ScanFilter) -> Self {
        self.scan_filter = filter;
        self
    }

    /// Set the scanner options.
    #[must_use]
    pub fn scan_options(mut self, options: ScanOptions) -> Self {
        self.scan_options = options;
        self
    }

    /// Set the scan restart backoff.
    #[must_use]
    pub fn scan_restart(mut self, retry: RetryConfig) -> Self {
        self.scan_restart = retry;
        self
    }

    /// Set the configured devices.
    #[must_use]
    pub fn devices(mut self, devices: Vec<DeviceConfig>) -> Self {
        self.devices = devices;
        self
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions running when shutdown began.
    pub sessions: usize,
    /// Sessions that had to be aborted after the shutdown timeout.
    pub sessions_aborted: usize,
    /// Outcome of the bridge flush.
    pub bridge: BridgeReport,
}

/// Ties the scanner, the sessions and the publish bridge together.
pub struct Coordinator {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<DecoderRegistry>,
    bridge: BridgeHandle,
    options: CoordinatorOptions,
}

impl Coordinator {
    /// Create a coordinator around a running bridge.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: DecoderRegistry,
        bridge: BridgeHandle,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            adapter,
            registry: Arc::new(registry),
            bridge,
            options,
        }
    }

    /// Run until `shutdown` resolves, then stop everything in order.
    ///
    /// Fails without creating any session when the first scan cannot start;
    /// the bridge is shut down before returning.
    pub async fn run<F>(self, shutdown: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        let Self {
            adapter,
            registry,
            bridge,
            options,
        } = self;

        let mut scanner = Scanner::new(Arc::clone(&adapter), options.scan_options.clone());
        let stream = match scanner.start(options.scan_filter.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scanning: {}", e);
                bridge.shutdown().await;
                return Err(e);
            }
        };

        let (readings_tx, readings) = mpsc::unbounded_channel();
        let (reports_tx, reports) = report_channel();
        let context = SessionContext::new(adapter, Arc::clone(&registry), readings_tx, reports_tx);

        info!(
            "Coordinator started ({} decoders, up to {} sessions)",
            registry.len(),
            options.max_sessions
        );

        let mut running = Running {
            scanner,
            stream: Some(stream),
            restart_at: None,
            scan_failures: 0,
            sessions: HashMap::new(),
            labeled: HashSet::new(),
            context,
            root: CancellationToken::new(),
            registry,
            bridge,
            options,
            readings,
            reports,
        };

        tokio::pin!(shutdown);
        loop {
            let restart_at = running.restart_at;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(report) = running.reports.recv() => running.on_report(report),
                Some(reading) = running.readings.recv() => running.bridge.publish(reading),
                item = next_advertisement(&mut running.stream) => running.on_scan(item).await,
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    running.restart_scan().await;
                }
            }
        }

        Ok(running.shutdown().await)
    }
}

async fn next_advertisement(stream: &mut Option<ScanStream>) -> Option<ScanResult> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// State of a started coordinator.
struct Running {
    scanner: Scanner,
    stream: Option<ScanStream>,
    restart_at: Option<Instant>,
    scan_failures: u32,
    sessions: HashMap<DeviceIdentity, SessionHandle>,
    /// Devices whose topic label is already set.
    labeled: HashSet<DeviceIdentity>,
    context: SessionContext,
    root: CancellationToken,
    registry: Arc<DecoderRegistry>,
    bridge: BridgeHandle,
    options: CoordinatorOptions,
    readings: mpsc::UnboundedReceiver<Reading>,
    reports: ReportReceiver,
}

impl Running {
    async fn on_scan(&mut self, item: Option<ScanResult>) {
        match item {
            Some(Ok(advertisement)) => {
                self.scan_failures = 0;
                self.on_advertisement(advertisement);
            }
            Some(Err(e)) => self.scan_failed(e.to_string()).await,
            None => self.scan_failed("scan stream closed".to_string()).await,
        }
    }

    async fn scan_failed(&mut self, reason: String) {
        self.stream = None;
        self.scanner.stop().await;

        let delay = self
            .options
            .scan_restart
            .delay_for_attempt(self.scan_failures);
        self.scan_failures = self.scan_failures.saturating_add(1);
        warn!(
            "Scanning stopped: {} (restarting in {:?}, attempt {})",
            reason, delay, self.scan_failures
        );
        self.restart_at = Some(Instant::now() + delay);
    }

    async fn restart_scan(&mut self) {
        self.restart_at = None;
        match self.scanner.start(self.options.scan_filter.clone()).await {
            Ok(stream) => {
                info!("Scanning resumed");
                self.stream = Some(stream);
            }
            Err(e) => self.scan_failed(e.to_string()).await,
        }
    }

    fn on_advertisement(&mut self, advertisement: Advertisement) {
        let identity = advertisement.identity.clone();
        let configured = self
            .options
            .devices
            .iter()
            .find(|device| device.matches(&advertisement));

        // Configured alias first, else the first name the device advertises
        let label = configured
            .and_then(|device| device.alias.as_deref())
            .or_else(|| {
                advertisement
                    .name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
            });
        if let Some(label) = label
            && self.labeled.insert(identity.clone())
        {
            debug!("Publishing {} as {}", identity, label);
            self.bridge.set_alias(identity.clone(), label);
        }
        let configured = configured.is_some();

        if self.registry.decodes_passively(&advertisement) {
            self.publish_passive(&advertisement);
        }

        if let Some(handle) = self.sessions.get(&identity) {
            if !handle.is_finished() {
                handle.confirm_presence();
                return;
            }
            self.sessions.remove(&identity);
        }

        if !configured && !self.registry.could_apply(&advertisement) {
            return;
        }

        if self.sessions.len() >= self.options.max_sessions {
            debug!(
                "Session limit ({}) reached, not admitting {}",
                self.options.max_sessions, identity
            );
            return;
        }

        info!(
            "Admitting {} ({}, rssi {:?})",
            identity,
            advertisement.name.as_deref().unwrap_or("unnamed"),
            advertisement.rssi
        );
        let handle = spawn_session(
            identity.clone(),
            self.context.clone(),
            self.options.session.clone(),
            &self.root,
        );
        self.sessions.insert(identity, handle);
    }

    fn publish_passive(&self, advertisement: &Advertisement) {
        let captured_at = OffsetDateTime::now_utc();
        for (source, decoded) in self.registry.decode_advertisement(advertisement) {
            match decoded {
                Ok(measurements) => {
                    debug!(
                        "Decoded {} values from {} advertisement",
                        measurements.len(),
                        advertisement.identity
                    );
                    for measurement in measurements {
                        self.bridge.publish(Reading::from_measurement(
                            advertisement.identity.clone(),
                            source,
                            measurement,
                            captured_at,
                        ));
                    }
                }
                Err(e) => debug!(
                    "Failed to decode advertisement from {}: {}",
                    advertisement.identity, e
                ),
            }
        }
    }

    fn on_report(&mut self, report: SessionReport) {
        match report {
            SessionReport::Abandoned { device, reason } => {
                if self.sessions.remove(&device).is_some() {
                    info!("Session for {} ended: {}", device, reason);
                }
            }
            SessionReport::StateChanged {
                device,
                from,
                to,
                retry_count,
            } => {
                debug!(
                    "{}: {:?} -> {:?} (retries {})",
                    device, from, to, retry_count
                );
            }
            SessionReport::CharacteristicFailed {
                device,
                characteristic,
                error,
            } => {
                debug!("{}: characteristic {} excluded: {}", device, characteristic, error);
            }
            SessionReport::DecodeFailed {
                device,
                characteristic,
                error,
            } => {
                debug!("{}: undecodable value on {}: {}", device, characteristic, error);
            }
            other => debug!("Session report: {:?}", other),
        }
    }

    async fn shutdown(mut self) -> ShutdownReport {
        self.stream = None;
        self.scanner.stop().await;
        self.restart_at = None;

        let sessions = self.sessions.len();
        info!("Stopping {} sessions", sessions);
        self.root.cancel();

        let deadline = Instant::now() + self.options.shutdown_timeout;
        let results = join_all(
            self.sessions
                .drain()
                .map(|(_, handle)| handle.join_until(deadline)),
        )
        .await;
        let sessions_aborted = results.iter().filter(|result| result.is_none()).count();
        if sessions_aborted > 0 {
            warn!(
                "{} sessions did not stop within {:?} and were aborted",
                sessions_aborted, self.options.shutdown_timeout
            );
        }

        while let Ok(reading) = self.readings.try_recv() {
            self.bridge.publish(reading);
        }

        let bridge = self.bridge.shutdown().await;
        ShutdownReport {
            sessions,
            sessions_aborted,
            bridge,
        }
    }
}
