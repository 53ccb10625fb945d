//! Publish bridge.
//!
//! One task owns the broker connection and the outage queue. Readings are
//! handed to it through [`BridgeHandle::publish`], which never blocks. Every
//! reading becomes a [`PublishJob`] that goes through the queue; the head job
//! is removed only once the broker confirmed it, so jobs queued during an
//! outage always reach the broker before newer ones.
//!
//! Connection health is exposed as a [`BrokerStatus`] on a watch channel.

use std::time::Duration;

use blueplug_core::RetryConfig;
use blueplug_types::{DeviceIdentity, Reading};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mqtt::{BrokerError, BrokerLink};
use crate::queue::{OutageQueue, OverflowPolicy, PublishJob};
use crate::topic::TopicMapper;

/// How long a clean disconnect may take on shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// State of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BrokerState {
    /// First connection attempt in progress.
    Connecting,
    /// Connected; queued jobs are being delivered.
    Connected,
    /// The broker is unreachable or rejected the connection; reconnecting.
    Degraded {
        /// Last failure.
        reason: String,
    },
    /// The bridge has shut down.
    Stopped,
}

/// Snapshot of the bridge's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    /// Connection state.
    pub state: BrokerState,
    /// Jobs waiting for delivery.
    pub queued: usize,
    /// Jobs discarded because the queue was full.
    pub dropped: u64,
    /// When the broker last confirmed a job.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_publish: Option<OffsetDateTime>,
}

impl Default for BrokerStatus {
    fn default() -> Self {
        Self {
            state: BrokerState::Connecting,
            queued: 0,
            dropped: 0,
            last_publish: None,
        }
    }
}

/// Options for the bridge task.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Outage queue capacity.
    pub queue_capacity: usize,
    /// What to discard when the queue is full.
    pub overflow: OverflowPolicy,
    /// Time allowed for flushing the queue on shutdown.
    pub flush_timeout: Duration,
    /// Reconnect backoff. Only the delay schedule is used; reconnecting
    /// never gives up.
    pub reconnect: RetryConfig,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            overflow: OverflowPolicy::DropOldest,
            flush_timeout: Duration::from_secs(5),
            reconnect: RetryConfig::new(u32::MAX)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(60)),
        }
    }
}

impl BridgeOptions {
    /// Set the queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// Set the shutdown flush deadline.
    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Set the reconnect backoff.
    #[must_use]
    pub fn reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Outcome of a bridge run, returned by [`BridgeHandle::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeReport {
    /// Jobs confirmed by the broker.
    pub delivered: u64,
    /// Jobs still queued when the bridge stopped.
    pub undelivered: usize,
    /// Jobs discarded because the queue was full.
    pub dropped: u64,
}

#[derive(Debug)]
enum BridgeRequest {
    Publish(Reading),
    Alias(DeviceIdentity, String),
}

/// Handle to the bridge task.
#[derive(Debug)]
pub struct BridgeHandle {
    requests: mpsc::UnboundedSender<BridgeRequest>,
    status: watch::Receiver<BrokerStatus>,
    cancel: CancellationToken,
    task: JoinHandle<BridgeReport>,
}

impl BridgeHandle {
    /// Queue a reading for publication.
    ///
    /// Never blocks and never fails; after shutdown the reading is discarded.
    pub fn publish(&self, reading: Reading) {
        if self.requests.send(BridgeRequest::Publish(reading)).is_err() {
            debug!("Bridge stopped, discarding reading");
        }
    }

    /// Publish a device under `alias` from now on.
    pub fn set_alias(&self, device: DeviceIdentity, alias: impl Into<String>) {
        let _ = self
            .requests
            .send(BridgeRequest::Alias(device, alias.into()));
    }

    /// Current status.
    pub fn status(&self) -> BrokerStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.clone()
    }

    /// Stop reconnecting, flush the queue until the flush deadline, then
    /// disconnect.
    pub async fn shutdown(self) -> BridgeReport {
        self.cancel.cancel();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!("Bridge task failed: {}", e);
                BridgeReport::default()
            }
        }
    }
}

/// Start the bridge task.
pub fn spawn_bridge<L>(link: L, mapper: TopicMapper, options: BridgeOptions) -> BridgeHandle
where
    L: BrokerLink + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(BrokerStatus::default());
    let cancel = CancellationToken::new();

    let bridge = Bridge {
        link,
        pipe: Pipeline {
            queue: OutageQueue::new(options.queue_capacity, options.overflow),
            mapper,
            status: status_tx,
            requests: rx,
            requests_open: true,
            cancel: cancel.clone(),
            deadline: None,
            delivered: 0,
            options,
            connected: false,
            failures: 0,
        },
    };
    let task = tokio::spawn(bridge.run());

    BridgeHandle {
        requests: tx,
        status: status_rx,
        cancel,
        task,
    }
}

enum Delivery {
    Confirmed,
    Failed(BrokerError),
    DeadlinePassed,
}

struct Bridge<L> {
    link: L,
    pipe: Pipeline,
}

/// Everything the bridge task owns besides the link.
struct Pipeline {
    queue: OutageQueue,
    mapper: TopicMapper,
    status: watch::Sender<BrokerStatus>,
    requests: mpsc::UnboundedReceiver<BridgeRequest>,
    requests_open: bool,
    cancel: CancellationToken,
    /// Set once shutdown started; the flush must finish before it.
    deadline: Option<Instant>,
    delivered: u64,
    options: BridgeOptions,
    connected: bool,
    /// Consecutive failed connection attempts.
    failures: u32,
}

impl Pipeline {
    /// Next request, or `None` once every handle is gone.
    async fn next_request(&mut self) -> Option<BridgeRequest> {
        if !self.requests_open {
            return std::future::pending().await;
        }
        let request = self.requests.recv().await;
        if request.is_none() {
            self.requests_open = false;
        }
        request
    }

    fn accept(&mut self, request: BridgeRequest) {
        match request {
            BridgeRequest::Publish(reading) => match self.mapper.job(&reading) {
                Ok(job) => {
                    if let Some(discarded) = self.queue.push(job) {
                        warn!(
                            "Outage queue full, dropped message for {} ({} dropped so far)",
                            discarded.topic,
                            self.queue.dropped()
                        );
                    }
                }
                Err(e) => warn!("Failed to encode reading {}: {}", reading.metric, e),
            },
            BridgeRequest::Alias(device, alias) => {
                debug!("Publishing {} as {}", device, alias);
                self.mapper.set_alias(device, alias);
            }
        }
        self.refresh_status();
    }

    fn begin_shutdown(&mut self) {
        if self.deadline.is_some() {
            return;
        }
        self.deadline = Some(Instant::now() + self.options.flush_timeout);
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            self.accept(request);
        }
        self.requests_open = false;
        if self.connected && !self.queue.is_empty() {
            info!(
                "Flushing {} queued messages (timeout {:?})",
                self.queue.len(),
                self.options.flush_timeout
            );
        }
    }

    fn confirm(&mut self) {
        if let Some(job) = self.queue.pop_front() {
            debug!("Published {}", job.topic);
        }
        self.delivered += 1;
        let now = OffsetDateTime::now_utc();
        let (queued, dropped) = (self.queue.len(), self.queue.dropped());
        self.status.send_modify(|status| {
            status.queued = queued;
            status.dropped = dropped;
            status.last_publish = Some(now);
        });
    }

    fn set_state(&self, state: BrokerState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }

    fn refresh_status(&self) {
        let (queued, dropped) = (self.queue.len(), self.queue.dropped());
        self.status.send_if_modified(|status| {
            let changed = status.queued != queued || status.dropped != dropped;
            status.queued = queued;
            status.dropped = dropped;
            changed
        });
    }
}

impl<L: BrokerLink> Bridge<L> {
    async fn run(mut self) -> BridgeReport {
        info!(
            "Publish bridge started (queue capacity {}, {:?})",
            self.pipe.queue.capacity(),
            self.pipe.options.overflow
        );

        loop {
            if self.pipe.cancel.is_cancelled() || !self.pipe.requests_open {
                self.pipe.begin_shutdown();
            }
            let draining = self.pipe.deadline.is_some();

            if !self.pipe.connected {
                if draining {
                    break;
                }
                self.establish().await;
                continue;
            }

            let Some(job) = self.pipe.queue.front().cloned() else {
                if draining {
                    break;
                }
                self.idle().await;
                continue;
            };

            match self.deliver(job).await {
                Delivery::Confirmed => self.pipe.confirm(),
                Delivery::Failed(e) => self.link_failed(e),
                Delivery::DeadlinePassed => {
                    warn!("Flush timeout reached");
                    break;
                }
            }
        }

        self.finish().await
    }

    /// One connection attempt, followed by a backoff delay if it failed.
    async fn establish(&mut self) {
        let cancel = self.pipe.cancel.clone();
        let result = {
            let connect = self.link.connect();
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    request = self.pipe.next_request() => match request {
                        Some(request) => self.pipe.accept(request),
                        None => break None,
                    },
                    result = &mut connect => break Some(result),
                }
            }
        };

        match result {
            None => {}
            Some(Ok(())) => {
                if self.pipe.failures > 0 {
                    info!(
                        "Broker connection restored after {} failed attempts, {} messages queued",
                        self.pipe.failures,
                        self.pipe.queue.len()
                    );
                }
                self.pipe.connected = true;
                self.pipe.failures = 0;
                self.pipe.set_state(BrokerState::Connected);
            }
            Some(Err(e)) => {
                self.link.reset();
                self.pipe.failures += 1;
                let failures = self.pipe.failures;
                if failures <= 3 {
                    warn!("Failed to connect to broker: {} (attempt {})", e, failures);
                } else if failures == 4 {
                    error!(
                        "Failed to connect to broker after {} attempts, will continue trying silently",
                        failures
                    );
                } else {
                    debug!("Broker connection attempt {} failed: {}", failures, e);
                }
                self.pipe.set_state(BrokerState::Degraded {
                    reason: e.to_string(),
                });

                let delay = self.pipe.options.reconnect.delay_for_attempt(failures - 1);
                self.back_off(delay).await;
            }
        }
    }

    /// Wait out a reconnect delay while still accepting readings.
    async fn back_off(&mut self, delay: Duration) {
        let cancel = self.pipe.cancel.clone();
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut timer => return,
                request = self.pipe.next_request() => match request {
                    Some(request) => self.pipe.accept(request),
                    None => return,
                },
            }
        }
    }

    /// Nothing queued: keep the connection alive until work or a failure
    /// arrives.
    async fn idle(&mut self) {
        let cancel = self.pipe.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            request = self.pipe.next_request() => {
                if let Some(request) = request {
                    self.pipe.accept(request);
                }
            }
            error = self.link.idle() => self.link_failed(error),
        }
    }

    /// Deliver the head job. The publish is never abandoned and restarted on
    /// the same connection; only the flush deadline cuts it short.
    async fn deliver(&mut self, job: PublishJob) -> Delivery {
        let cancel = self.pipe.cancel.clone();
        let publish = self.link.publish(&job);
        tokio::pin!(publish);

        loop {
            let deadline = self.pipe.deadline;
            tokio::select! {
                biased;
                result = &mut publish => {
                    return match result {
                        Ok(()) => Delivery::Confirmed,
                        Err(e) => Delivery::Failed(e),
                    };
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Delivery::DeadlinePassed;
                }
                _ = cancel.cancelled(), if deadline.is_none() => self.pipe.begin_shutdown(),
                request = self.pipe.next_request(), if deadline.is_none() => match request {
                    Some(request) => self.pipe.accept(request),
                    None => self.pipe.begin_shutdown(),
                },
            }
        }
    }

    fn link_failed(&mut self, error: BrokerError) {
        warn!(
            "Broker connection lost: {} ({} messages queued)",
            error,
            self.pipe.queue.len()
        );
        self.link.reset();
        self.pipe.connected = false;
        self.pipe.set_state(BrokerState::Degraded {
            reason: error.to_string(),
        });
    }

    async fn finish(mut self) -> BridgeReport {
        if self.pipe.connected {
            if timeout(DISCONNECT_TIMEOUT, self.link.disconnect())
                .await
                .is_err()
            {
                debug!("Broker disconnect timed out");
            }
        }
        self.link.reset();
        self.pipe.connected = false;

        let report = BridgeReport {
            delivered: self.pipe.delivered,
            undelivered: self.pipe.queue.len(),
            dropped: self.pipe.queue.dropped(),
        };
        if report.undelivered > 0 {
            warn!("{} queued messages were not delivered", report.undelivered);
        }
        self.pipe.refresh_status();
        self.pipe.set_state(BrokerState::Stopped);
        info!(
            "Publish bridge stopped ({} delivered, {} dropped)",
            report.delivered, report.dropped
        );
        report
    }
}
