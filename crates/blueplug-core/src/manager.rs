//! Device session tasks.
//!
//! [`spawn_session`] starts one tokio task per admitted device. The task owns
//! the device's link and drives its [`Session`] through the state machine:
//! connect, discover, subscribe, stream, and on link loss back off and wait
//! for the scanner to see the device again before reconnecting.
//!
//! Every radio operation is raced against the session's cancellation token and
//! its command channel, so a shutdown or removal interrupts whatever is in
//! flight. The link is always disconnected and dropped before the session
//! enters a state that does not hold one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blueplug_types::{DeviceIdentity, Reading, ReadingSource};

use crate::decoder::{Decoder, DecoderRegistry};
use crate::error::{Error, Result};
use crate::events::{ReportSender, SessionPhase, SessionReport};
use crate::retry::{RetryConfig, with_retry};
use crate::session::{AbandonReason, Session, SessionEvent, SessionState};
use crate::traits::{BleAdapter, BleLink, CharProps, GattService, NotificationStream};

/// How long a disconnect may take before the link is dropped anyway.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing and retry options for sessions.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Timeout for establishing a link.
    pub connect_timeout: Duration,
    /// Timeout for service discovery and each subscribe or read.
    pub discovery_timeout: Duration,
    /// Interval for polling characteristics that cannot notify.
    pub poll_interval: Duration,
    /// Interval for checking that a streaming link is still up.
    pub liveness_interval: Duration,
    /// Retry budget and backoff for reconnects.
    pub retry: RetryConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(60),
            liveness_interval: Duration::from_secs(30),
            retry: RetryConfig::for_reconnect(),
        }
    }
}

impl SessionOptions {
    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the liveness check interval.
    #[must_use]
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Set the retry configuration.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Commands from the coordinator to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// The scanner saw the device again.
    PresenceConfirmed,
    /// Disconnect and end the session.
    Disconnect,
}

/// Sender for decoded readings.
pub type ReadingSender = mpsc::UnboundedSender<Reading>;

/// Shared resources every session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// The host radio.
    pub adapter: Arc<dyn BleAdapter>,
    /// Decoders for matched characteristics.
    pub registry: Arc<DecoderRegistry>,
    /// Serializes connect attempts across sessions.
    pub connect_permit: Arc<Semaphore>,
    /// Where decoded readings go.
    pub readings: ReadingSender,
    /// Where health reports go.
    pub reports: ReportSender,
}

impl SessionContext {
    /// Create a context with a single connect permit.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DecoderRegistry>,
        readings: ReadingSender,
        reports: ReportSender,
    ) -> Self {
        Self {
            adapter,
            registry,
            connect_permit: Arc::new(Semaphore::new(1)),
            readings,
            reports,
        }
    }
}

/// Handle to a running session task.
///
/// Held by the coordinator, keyed by identity. Dropping the handle does not
/// stop the task; use [`cancel`](Self::cancel) or [`disconnect`](Self::disconnect).
#[derive(Debug)]
pub struct SessionHandle {
    identity: DeviceIdentity,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    handle: JoinHandle<AbandonReason>,
}

impl SessionHandle {
    /// Device identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Forward a scanner sighting.
    pub fn confirm_presence(&self) {
        let _ = self.commands.send(SessionCommand::PresenceConfirmed);
    }

    /// Ask the session to disconnect and end.
    pub fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect);
    }

    /// Cancel the session for shutdown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to end and return why it ended.
    pub async fn join(self) -> AbandonReason {
        self.handle.await.unwrap_or(AbandonReason::Shutdown)
    }

    /// Wait for the task to end, aborting it if `deadline` passes first.
    ///
    /// Returns `None` when the task had to be aborted.
    pub async fn join_until(mut self, deadline: Instant) -> Option<AbandonReason> {
        match tokio::time::timeout_at(deadline, &mut self.handle).await {
            Ok(result) => Some(result.unwrap_or(AbandonReason::Shutdown)),
            Err(_) => {
                self.handle.abort();
                None
            }
        }
    }

    /// Abort the task without waiting for a graceful disconnect.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Spawn a session task for an admitted device.
///
/// `parent` is the coordinator's cancellation token; cancelling it cancels
/// every session.
pub fn spawn_session(
    identity: DeviceIdentity,
    context: SessionContext,
    options: SessionOptions,
    parent: &CancellationToken,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = parent.child_token();

    let runner = SessionRunner {
        session: Session::new(identity.clone(), options.retry.clone()),
        control: Control {
            cancel: cancel.clone(),
            commands: rx,
            presence_confirmed: false,
        },
        context,
        options,
        link: None,
        matched: Vec::new(),
    };
    let handle = tokio::spawn(runner.run());

    SessionHandle {
        identity,
        commands: tx,
        cancel,
        handle,
    }
}

/// Why a radio operation was not allowed to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Shutdown,
    Removed,
}

impl From<Interrupt> for SessionEvent {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Shutdown => SessionEvent::Shutdown,
            Interrupt::Removed => SessionEvent::Removed,
        }
    }
}

/// Cancellation and commands, kept apart from the link so operations on the
/// link can be raced against them.
struct Control {
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    presence_confirmed: bool,
}

impl Control {
    /// Run `fut` unless the session is cancelled or removed first.
    ///
    /// Presence confirmations that arrive meanwhile are recorded.
    async fn race<F: Future>(&mut self, fut: F) -> std::result::Result<F::Output, Interrupt> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Interrupt::Shutdown),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::PresenceConfirmed) => self.presence_confirmed = true,
                    Some(SessionCommand::Disconnect) => return Err(Interrupt::Removed),
                    None => return Err(Interrupt::Shutdown),
                },
                output = &mut fut => return Ok(output),
            }
        }
    }

    /// Wait for the next presence confirmation.
    async fn wait_presence(&mut self) -> std::result::Result<(), Interrupt> {
        while !self.presence_confirmed {
            self.race(std::future::pending::<()>()).await?;
        }
        Ok(())
    }
}

/// A characteristic with a decoder.
struct Matched {
    service: Uuid,
    characteristic: Uuid,
    props: CharProps,
    decoder: Decoder,
}

/// Outcome of subscribe/read setup.
#[derive(Default)]
struct Setup {
    subscribed: Vec<usize>,
    polled: Vec<usize>,
    notifications: Option<NotificationStream>,
}

struct SessionRunner {
    session: Session,
    control: Control,
    context: SessionContext,
    options: SessionOptions,
    link: Option<Box<dyn BleLink>>,
    matched: Vec<Matched>,
}

impl SessionRunner {
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.session.identity()))]
    async fn run(mut self) -> AbandonReason {
        let mut event = SessionEvent::Admitted;
        let mut setup = Setup::default();

        loop {
            let next = match self.session.peek(&event) {
                Ok(next) => next,
                Err(e) => {
                    // Unreachable with a correct driver; end the session rather than spin.
                    warn!("{}", e);
                    SessionState::Abandoned {
                        reason: AbandonReason::Shutdown,
                    }
                }
            };
            if !next.holds_link() {
                self.release_link().await;
            }
            self.enter(next);

            event = match self.session.state().clone() {
                SessionState::Abandoned { reason } => {
                    let _ = self.context.reports.send(SessionReport::Abandoned {
                        device: self.session.identity().clone(),
                        reason,
                    });
                    info!("Session abandoned: {}", reason);
                    return reason;
                }
                SessionState::Connecting { attempt } => self.connect(attempt).await,
                SessionState::ServiceDiscovery => self.discover().await,
                SessionState::Subscribing { .. } => match self.subscribe().await {
                    Ok(done) => {
                        let count = done.subscribed.len() + done.polled.len();
                        setup = done;
                        SessionEvent::Subscribed { count }
                    }
                    Err(event) => event,
                },
                SessionState::Streaming { .. } => self.stream(&mut setup).await,
                SessionState::Disconnected { .. } => {
                    setup = Setup::default();
                    SessionEvent::Backoff
                }
                SessionState::Retrying { delay, .. } => self.back_off(delay).await,
                SessionState::Discovered => SessionEvent::Admitted,
            };
        }
    }

    fn enter(&mut self, next: SessionState) {
        if matches!(next, SessionState::Retrying { .. }) {
            // Only sightings after the link was lost count
            self.control.presence_confirmed = false;
        }
        let previous = self.session.enter(next);
        let current = self.session.state();
        if previous != *current {
            match current {
                SessionState::Disconnected { reason } => warn!("{} -> {}", previous.name(), reason),
                SessionState::Retrying { .. } => warn!("{}", current),
                _ => info!("{} -> {}", previous.name(), current),
            }
            let _ = self.context.reports.send(SessionReport::StateChanged {
                device: self.session.identity().clone(),
                from: SessionPhase::from(&previous),
                to: SessionPhase::from(current),
                retry_count: self.session.retry_count(),
            });
        }
    }

    async fn connect(&mut self, attempt: u32) -> SessionEvent {
        let identity = self.session.identity().clone();
        let permit_source = Arc::clone(&self.context.connect_permit);
        let permit = match self.control.race(permit_source.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return SessionEvent::Shutdown,
            Err(interrupt) => return interrupt.into(),
        };

        debug!("Connecting (attempt {})", attempt);
        let adapter = Arc::clone(&self.context.adapter);
        let connect = timeout(self.options.connect_timeout, adapter.connect(&identity));
        let result = self.control.race(connect).await;
        drop(permit);

        match result {
            Ok(Ok(Ok(link))) => {
                self.link = Some(link);
                SessionEvent::Connected
            }
            Ok(Ok(Err(e))) => SessionEvent::LinkLost {
                reason: format!("connect failed: {e}"),
            },
            Ok(Err(_elapsed)) => {
                warn!(
                    "Connect timed out after {:?}",
                    self.options.connect_timeout
                );
                SessionEvent::ConnectTimedOut
            }
            Err(interrupt) => interrupt.into(),
        }
    }

    async fn discover(&mut self) -> SessionEvent {
        let Some(link) = self.link.as_ref() else {
            return lost("no link");
        };
        let discovery = timeout(self.options.discovery_timeout, link.discover());
        let services = match self.control.race(discovery).await {
            Ok(Ok(Ok(services))) => services,
            Ok(Ok(Err(e))) => return lost(format!("service discovery failed: {e}")),
            Ok(Err(_)) => {
                return lost(
                    Error::timeout("service discovery", self.options.discovery_timeout)
                        .to_string(),
                );
            }
            Err(interrupt) => return interrupt.into(),
        };

        self.matched = match_characteristics(&self.context.registry, &services);
        debug!(
            services = services.len(),
            matched = self.matched.len(),
            "Service discovery complete"
        );
        SessionEvent::ServicesMatched {
            count: self.matched.len(),
        }
    }

    async fn subscribe(&mut self) -> std::result::Result<Setup, SessionEvent> {
        let Some(link) = self.link.as_ref() else {
            return Err(lost("no link"));
        };
        let step = self.options.discovery_timeout;
        let mut setup = Setup::default();

        if self.matched.iter().any(|m| m.props.can_subscribe()) {
            match self.control.race(timeout(step, link.notifications())).await {
                Ok(Ok(Ok(stream))) => setup.notifications = Some(stream),
                Ok(Ok(Err(e))) => return Err(lost(format!("notification stream failed: {e}"))),
                Ok(Err(_)) => return Err(lost("notification stream setup timed out")),
                Err(interrupt) => return Err(interrupt.into()),
            }
        }

        for (index, matched) in self.matched.iter().enumerate() {
            let (service, characteristic) = (matched.service, matched.characteristic);
            let operation = if matched.props.can_subscribe() {
                "subscribe"
            } else {
                "read"
            };
            let outcome = if matched.props.can_subscribe() {
                self.control
                    .race(timeout(step, link.subscribe(service, characteristic)))
                    .await
                    .map(|r| r.map(|r| r.map(|()| None)))
            } else {
                self.control
                    .race(timeout(step, link.read(service, characteristic)))
                    .await
                    .map(|r| r.map(|r| r.map(Some)))
            };

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::timeout(operation, step)),
                Err(interrupt) => return Err(interrupt.into()),
            };

            match result {
                Ok(None) => setup.subscribed.push(index),
                Ok(Some(initial)) => {
                    setup.polled.push(index);
                    forward(&self.context, &self.session, matched, &initial);
                }
                Err(e) if e.is_link_failure() && !link.is_connected().await => {
                    return Err(lost(e.to_string()));
                }
                Err(e) => {
                    warn!("Excluding characteristic {}: {}", characteristic, e);
                    let _ = self
                        .context
                        .reports
                        .send(SessionReport::CharacteristicFailed {
                            device: self.session.identity().clone(),
                            characteristic,
                            error: e.to_string(),
                        });
                }
            }
        }

        let active = setup
            .subscribed
            .iter()
            .chain(&setup.polled)
            .map(|&i| self.matched[i].characteristic)
            .collect();
        self.session.set_subscribed(active);
        Ok(setup)
    }

    async fn stream(&mut self, setup: &mut Setup) -> SessionEvent {
        let Some(link) = self.link.as_ref() else {
            return lost("no link");
        };

        let mut poll = interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Polled characteristics were read once during setup
        poll.reset();
        let mut liveness = interval(self.options.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.reset();

        let has_polled = !setup.polled.is_empty();
        let read_retry = RetryConfig::for_read();
        let step = self.options.discovery_timeout;

        loop {
            tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return SessionEvent::Shutdown,
                command = self.control.commands.recv() => match command {
                    Some(SessionCommand::PresenceConfirmed) => self.session.touch(),
                    Some(SessionCommand::Disconnect) => return SessionEvent::Removed,
                    None => return SessionEvent::Shutdown,
                },
                notification = next_notification(&mut setup.notifications) => {
                    let Some(notification) = notification else {
                        return lost("notification stream ended");
                    };
                    let matched = setup
                        .subscribed
                        .iter()
                        .map(|&i| &self.matched[i])
                        .find(|m| m.characteristic == notification.characteristic);
                    match matched {
                        Some(matched) => {
                            forward(&self.context, &self.session, matched, &notification.value);
                        }
                        None => debug!(
                            "Ignoring notification from unmatched characteristic {}",
                            notification.characteristic
                        ),
                    }
                }
                _ = poll.tick(), if has_polled => {
                    for &index in &setup.polled {
                        let matched = &self.matched[index];
                        let (service, characteristic) = (matched.service, matched.characteristic);
                        let read = with_retry(&read_retry, "read characteristic", || async move {
                            timeout(step, link.read(service, characteristic))
                                .await
                                .unwrap_or_else(|_| Err(Error::timeout("read characteristic", step)))
                        });
                        match self.control.race(read).await {
                            Ok(Ok(value)) => forward(&self.context, &self.session, matched, &value),
                            Ok(Err(e)) if e.is_link_failure() => return lost(e.to_string()),
                            Ok(Err(e)) => warn!("Read of {} failed: {}", characteristic, e),
                            Err(interrupt) => return interrupt.into(),
                        }
                    }
                }
                _ = liveness.tick() => {
                    match self.control.race(timeout(step, link.is_connected())).await {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => return lost("liveness check failed"),
                        Ok(Err(_)) => return lost("liveness check timed out"),
                        Err(interrupt) => return interrupt.into(),
                    }
                }
            }
        }
    }

    async fn back_off(&mut self, delay: Duration) -> SessionEvent {
        let deadline = Instant::now() + delay;
        if let Err(interrupt) = self.control.race(sleep_until(deadline)).await {
            return interrupt.into();
        }
        if !self.control.presence_confirmed {
            debug!("Backoff elapsed, waiting for the device to advertise");
        }
        match self.control.wait_presence().await {
            Ok(()) => SessionEvent::RetryReady,
            Err(interrupt) => interrupt.into(),
        }
    }

    /// Disconnect and drop the link, if any. Not raced against cancellation.
    async fn release_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match timeout(DISCONNECT_TIMEOUT, link.disconnect()).await {
            Ok(Ok(())) => debug!("Link released"),
            Ok(Err(e)) => debug!("Disconnect failed, dropping link: {}", e),
            Err(_) => debug!("Disconnect timed out, dropping link"),
        }
        self.matched.clear();
    }
}

fn lost(reason: impl Into<String>) -> SessionEvent {
    SessionEvent::LinkLost {
        reason: reason.into(),
    }
}

async fn next_notification(
    stream: &mut Option<NotificationStream>,
) -> Option<crate::traits::Notification> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Pair every discovered characteristic with its decoder, if any.
fn match_characteristics(registry: &DecoderRegistry, services: &[GattService]) -> Vec<Matched> {
    services
        .iter()
        .flat_map(|service| &service.characteristics)
        .filter(|c| c.props.can_subscribe() || c.props.read)
        .filter_map(|c| {
            registry.resolve(c.service, c.uuid).map(|decoder| Matched {
                service: c.service,
                characteristic: c.uuid,
                props: c.props,
                decoder: decoder.clone(),
            })
        })
        .collect()
}

/// Decode a payload and forward the readings in order.
///
/// Decode failures are reported and skipped.
fn forward(context: &SessionContext, session: &Session, matched: &Matched, payload: &[u8]) {
    let device = session.identity();
    match matched.decoder.decode(payload) {
        Ok(measurements) => {
            let captured_at = OffsetDateTime::now_utc();
            let source = ReadingSource::Characteristic {
                service: matched.service,
                characteristic: matched.characteristic,
            };
            for measurement in measurements {
                debug!(
                    metric = %measurement.metric,
                    value = measurement.value,
                    "Reading"
                );
                let reading =
                    Reading::from_measurement(device.clone(), source, measurement, captured_at);
                if context.readings.send(reading).is_err() {
                    debug!("Reading receiver dropped");
                }
            }
        }
        Err(e) => {
            warn!("Failed to decode {}: {}", matched.characteristic, e);
            let _ = context.reports.send(SessionReport::DecodeFailed {
                device: device.clone(),
                characteristic: matched.characteristic,
                error: e.to_string(),
            });
        }
    }
}

/// Connect to a known device and list its decodable characteristics.
///
/// Bypasses the session machinery; used for one-off probes of a device.
pub async fn connect_and_match(
    adapter: &dyn BleAdapter,
    registry: &DecoderRegistry,
    identity: &DeviceIdentity,
    connect_timeout: Duration,
) -> Result<(Box<dyn BleLink>, Vec<(Uuid, Uuid)>)> {
    let link = timeout(connect_timeout, adapter.connect(identity))
        .await
        .map_err(|_| Error::timeout("connect", connect_timeout))??;
    let services = link.discover().await?;
    let pairs = match_characteristics(registry, &services)
        .into_iter()
        .map(|m| (m.service, m.characteristic))
        .collect();
    Ok((link, pairs))
}
