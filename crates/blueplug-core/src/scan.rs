//! Radio scanner.
//!
//! [`Scanner::start`] activates host scanning and returns a [`ScanStream`] of
//! filtered, deduplicated advertisements. Advertisements from one identity
//! that arrive within the dedup window of the last emitted one are coalesced
//! into the next emission, so chatty beacons do not flood the coordinator.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};
use crate::traits::BleAdapter;

/// Which advertisements the scanner passes on.
///
/// Criteria are OR-ed: an advertisement passes if it lists one of the
/// services, or carries service data for one of them, or its local name
/// matches the pattern. An empty filter passes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Service UUIDs of interest.
    pub services: Vec<Uuid>,
    /// Case-insensitive local name pattern. `*` matches any run of
    /// characters; a pattern without `*` matches as a substring.
    pub name_pattern: Option<String>,
}

impl ScanFilter {
    /// A filter that passes everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service UUID.
    #[must_use]
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.services.push(uuid);
        self
    }

    /// Set the name pattern.
    #[must_use]
    pub fn name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    /// Whether the filter has no criteria.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.name_pattern.is_none()
    }

    /// Check an advertisement against the filter.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if self.is_empty() {
            return true;
        }

        let service_match = self.services.iter().any(|uuid| {
            advertisement.advertises_service(uuid) || advertisement.service_data.contains_key(uuid)
        });
        if service_match {
            return true;
        }

        match (&self.name_pattern, &advertisement.name) {
            (Some(pattern), Some(name)) => name_matches(pattern, name),
            _ => false,
        }
    }

    /// Services to hand to the platform scan filter.
    ///
    /// Platform filtering would hide name-only matches, so it is only used
    /// when no name pattern is configured.
    fn platform_services(&self) -> &[Uuid] {
        if self.name_pattern.is_some() {
            &[]
        } else {
            &self.services
        }
    }
}

/// Case-insensitive glob match with `*` wildcards.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    if !pattern.contains(&'*') {
        return name.windows(pattern.len().max(1)).any(|w| w == pattern.as_slice())
            || pattern.is_empty();
    }

    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if p < pattern.len() && pattern[p] == name[n] {
            p += 1;
            n += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// Options for the scanner.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Advertisements from one identity within this window are coalesced.
    pub dedup_window: Duration,
    /// Capacity of the channel between the pump task and the stream.
    pub channel_capacity: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

impl ScanOptions {
    /// Set the dedup window.
    #[must_use]
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set the channel capacity.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug)]
struct DedupEntry {
    last_emitted: Instant,
    pending: Option<Advertisement>,
}

/// Per-identity coalescing of advertisements.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    entries: HashMap<DeviceIdentity, DedupEntry>,
    observed: u64,
}

/// Prune stale entries every this many observations.
const PRUNE_EVERY: u64 = 1024;

impl Deduplicator {
    /// Create a deduplicator with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
            observed: 0,
        }
    }

    /// Feed one advertisement.
    ///
    /// Returns the advertisement to emit, or `None` if it was coalesced into
    /// a pending one. An emitted advertisement carries everything coalesced
    /// since the previous emission, with the newest signal strength.
    pub fn observe(&mut self, advertisement: Advertisement) -> Option<Advertisement> {
        self.observed += 1;
        if self.observed.is_multiple_of(PRUNE_EVERY) {
            self.prune(advertisement.received_at);
        }

        let now = advertisement.received_at;
        let Some(entry) = self.entries.get_mut(&advertisement.identity) else {
            self.entries.insert(
                advertisement.identity.clone(),
                DedupEntry {
                    last_emitted: now,
                    pending: None,
                },
            );
            return Some(advertisement);
        };

        if now.saturating_duration_since(entry.last_emitted) < self.window {
            match &mut entry.pending {
                Some(pending) => pending.merge(advertisement),
                None => entry.pending = Some(advertisement),
            }
            return None;
        }

        entry.last_emitted = now;
        let emitted = match entry.pending.take() {
            Some(mut pending) => {
                pending.merge(advertisement);
                pending
            }
            None => advertisement,
        };
        Some(emitted)
    }

    /// Forget identities not emitted for a long time.
    fn prune(&mut self, now: Instant) {
        let horizon = (self.window * 10).max(Duration::from_secs(60));
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_emitted) < horizon);
    }

    /// Number of tracked identities.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Item type of a [`ScanStream`].
pub type ScanResult = std::result::Result<Advertisement, Error>;

/// Restartable scanner over a shared adapter.
pub struct Scanner {
    adapter: Arc<dyn BleAdapter>,
    options: ScanOptions,
    active: Option<CancellationToken>,
}

impl Scanner {
    /// Create a scanner.
    pub fn new(adapter: Arc<dyn BleAdapter>, options: ScanOptions) -> Self {
        Self {
            adapter,
            options,
            active: None,
        }
    }

    /// Start scanning.
    ///
    /// Stops any scan started earlier by this scanner. Fails with
    /// [`Error::AdapterUnavailable`] when the radio cannot scan. The returned
    /// stream yields the same error if the platform stream ends.
    pub async fn start(&mut self, filter: ScanFilter) -> Result<ScanStream> {
        self.stop().await;

        let mut raw = self.adapter.start_scan(filter.platform_services()).await?;
        info!(
            services = filter.services.len(),
            name_pattern = filter.name_pattern.as_deref().unwrap_or("-"),
            "Scan started"
        );

        let (tx, rx) = mpsc::channel(self.options.channel_capacity);
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let mut dedup = Deduplicator::new(self.options.dedup_window);

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = task_token.cancelled() => {
                        debug!("Scan cancelled, stopping gracefully");
                        break;
                    }
                    next = raw.next() => next,
                };

                let Some(advertisement) = next else {
                    warn!("Advertisement stream ended");
                    let _ = tx
                        .send(Err(Error::adapter_unavailable("advertisement stream ended")))
                        .await;
                    break;
                };

                if !filter.matches(&advertisement) {
                    continue;
                }
                if let Some(emitted) = dedup.observe(advertisement) {
                    let sent = tokio::select! {
                        _ = task_token.cancelled() => break,
                        sent = tx.send(Ok(emitted)) => sent,
                    };
                    if sent.is_err() {
                        debug!("Scan receiver dropped, stopping");
                        break;
                    }
                }
            }
        });

        self.active = Some(cancel_token.clone());
        Ok(ScanStream {
            receiver: rx,
            handle,
            cancel_token,
        })
    }

    /// Stop the active scan, if any.
    pub async fn stop(&mut self) {
        if let Some(token) = self.active.take() {
            token.cancel();
            if let Err(e) = self.adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
            info!("Scan stopped");
        }
    }

    /// Whether a scan started by this scanner is still running.
    pub fn is_scanning(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

/// Stream of advertisements from an active scan.
///
/// Dropping the stream stops the pump task. The platform scan itself is
/// owned by the [`Scanner`] and stops with [`Scanner::stop`].
pub struct ScanStream {
    receiver: mpsc::Receiver<ScanResult>,
    handle: tokio::task::JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl ScanStream {
    /// Stop the scan.
    pub fn close(self) {
        self.cancel_token.cancel();
    }

    /// Check if the pump task is still running.
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl Stream for ScanStream {
    type Item = ScanResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}
