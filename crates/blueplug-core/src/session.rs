//! Session state machine.
//!
//! Every device being bridged has a [`Session`] whose lifecycle is:
//!
//! ```text
//! Discovered -> Connecting -> ServiceDiscovery -> Subscribing -> Streaming
//!                  |  ^                                              |
//!                  |  |            (link error from any state)       v
//!                  |  +------------ Retrying <----------------- Disconnected
//!                  |                                                 |
//!                  +-------------------> Abandoned <-----------------+
//! ```
//!
//! Transitions are computed by [`SessionState::on`], a pure function of the
//! current state, the event and the retry budget. Anything not listed there is
//! refused with [`Error::InvalidTransition`], so a session cannot, for example,
//! start streaming while disconnected.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Why a session was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AbandonReason {
    /// The device exposes no characteristic with a registered decoder.
    NoMatchingCharacteristics,
    /// The retry budget ran out.
    RetriesExhausted,
    /// The coordinator removed the device.
    Removed,
    /// The bridge is shutting down.
    Shutdown,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoMatchingCharacteristics => "no matching characteristics",
            Self::RetriesExhausted => "retries exhausted",
            Self::Removed => "removed",
            Self::Shutdown => "shutdown",
        })
    }
}

/// State of one device session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Seen in an advertisement, not yet admitted.
    Discovered,
    /// Establishing the link.
    Connecting {
        /// Connection attempt number, 1-based.
        attempt: u32,
    },
    /// Enumerating services and characteristics.
    ServiceDiscovery,
    /// Subscribing to (or setting up polling of) matched characteristics.
    Subscribing {
        /// Number of characteristics with a decoder.
        matched: usize,
    },
    /// Forwarding readings.
    Streaming {
        /// Number of characteristics delivering data.
        active: usize,
    },
    /// Link gone; deciding whether to retry.
    Disconnected {
        /// What ended the link.
        reason: String,
    },
    /// Waiting for the backoff delay and a fresh advertisement.
    Retrying {
        /// Retry number, 1-based.
        attempt: u32,
        /// Backoff before the next connect.
        delay: Duration,
    },
    /// Terminal.
    Abandoned {
        /// Why the session ended.
        reason: AbandonReason,
    },
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The coordinator accepted the device.
    Admitted,
    /// Link established.
    Connected,
    /// Connect did not finish within the timeout.
    ConnectTimedOut,
    /// Service discovery finished with this many decodable characteristics.
    ServicesMatched {
        /// Number of matched characteristics.
        count: usize,
    },
    /// Subscribe/read setup finished with this many working characteristics.
    Subscribed {
        /// Number of working characteristics.
        count: usize,
    },
    /// Link-level error or radio loss.
    LinkLost {
        /// Description of the failure.
        reason: String,
    },
    /// Decide between retrying and giving up.
    Backoff,
    /// Backoff elapsed and presence confirmed by the scanner.
    RetryReady,
    /// The coordinator removed the device.
    Removed,
    /// The bridge is shutting down.
    Shutdown,
}

impl SessionEvent {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Admitted => "Admitted",
            Self::Connected => "Connected",
            Self::ConnectTimedOut => "ConnectTimedOut",
            Self::ServicesMatched { .. } => "ServicesMatched",
            Self::Subscribed { .. } => "Subscribed",
            Self::LinkLost { .. } => "LinkLost",
            Self::Backoff => "Backoff",
            Self::RetryReady => "RetryReady",
            Self::Removed => "Removed",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl SessionState {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered => "Discovered",
            Self::Connecting { .. } => "Connecting",
            Self::ServiceDiscovery => "ServiceDiscovery",
            Self::Subscribing { .. } => "Subscribing",
            Self::Streaming { .. } => "Streaming",
            Self::Disconnected { .. } => "Disconnected",
            Self::Retrying { .. } => "Retrying",
            Self::Abandoned { .. } => "Abandoned",
        }
    }

    /// Whether the session is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abandoned { .. })
    }

    /// Whether a link may be held in this state.
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            Self::ServiceDiscovery | Self::Subscribing { .. } | Self::Streaming { .. }
        )
    }

    /// Compute the state that follows `event`.
    ///
    /// `retry_count` is the number of retries already spent in the current
    /// cycle; it decides between `Retrying` and `Abandoned`.
    pub fn on(
        &self,
        event: &SessionEvent,
        retry: &RetryConfig,
        retry_count: u32,
    ) -> Result<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (S::Abandoned { .. }, _) => return Err(self.refuse(event)),

            (_, E::Shutdown) => S::Abandoned {
                reason: AbandonReason::Shutdown,
            },
            (_, E::Removed) => S::Abandoned {
                reason: AbandonReason::Removed,
            },

            (S::Discovered, E::Admitted) => S::Connecting {
                attempt: retry_count + 1,
            },

            (S::Connecting { .. }, E::Connected) => S::ServiceDiscovery,
            (S::Connecting { .. }, E::ConnectTimedOut) => Self::retry_or_abandon(retry, retry_count),

            (S::ServiceDiscovery, E::ServicesMatched { count: 0 }) => S::Abandoned {
                reason: AbandonReason::NoMatchingCharacteristics,
            },
            (S::ServiceDiscovery, E::ServicesMatched { count }) => {
                S::Subscribing { matched: *count }
            }

            (S::Subscribing { .. }, E::Subscribed { count: 0 }) => S::Disconnected {
                reason: "no characteristic could be set up".to_string(),
            },
            (S::Subscribing { .. }, E::Subscribed { count }) => S::Streaming { active: *count },

            (
                S::Connecting { .. }
                | S::ServiceDiscovery
                | S::Subscribing { .. }
                | S::Streaming { .. },
                E::LinkLost { reason },
            ) => S::Disconnected {
                reason: reason.clone(),
            },

            (S::Disconnected { .. }, E::Backoff) => Self::retry_or_abandon(retry, retry_count),

            (S::Retrying { attempt, .. }, E::RetryReady) => S::Connecting {
                attempt: attempt + 1,
            },

            _ => return Err(self.refuse(event)),
        };

        Ok(next)
    }

    fn retry_or_abandon(retry: &RetryConfig, retry_count: u32) -> SessionState {
        if retry.is_exhausted(retry_count) {
            SessionState::Abandoned {
                reason: AbandonReason::RetriesExhausted,
            }
        } else {
            SessionState::Retrying {
                attempt: retry_count + 1,
                delay: retry.delay_for_attempt(retry_count),
            }
        }
    }

    fn refuse(&self, event: &SessionEvent) -> Error {
        Error::InvalidTransition {
            state: self.name(),
            event: event.name(),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { attempt } => write!(f, "Connecting (attempt {attempt})"),
            Self::Subscribing { matched } => write!(f, "Subscribing ({matched} matched)"),
            Self::Streaming { active } => write!(f, "Streaming ({active} active)"),
            Self::Disconnected { reason } => write!(f, "Disconnected ({reason})"),
            Self::Retrying { attempt, delay } => {
                write!(f, "Retrying (attempt {attempt}, in {delay:?})")
            }
            Self::Abandoned { reason } => write!(f, "Abandoned ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One device session: its state plus the bookkeeping around it.
#[derive(Debug, Clone)]
pub struct Session {
    identity: DeviceIdentity,
    state: SessionState,
    retry: RetryConfig,
    retry_count: u32,
    last_seen: Instant,
    subscribed: Vec<Uuid>,
}

impl Session {
    /// Create a session in `Discovered`.
    pub fn new(identity: DeviceIdentity, retry: RetryConfig) -> Self {
        Self {
            identity,
            state: SessionState::Discovered,
            retry,
            retry_count: 0,
            last_seen: Instant::now(),
            subscribed: Vec::new(),
        }
    }

    /// Device identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Retries spent since the session last reached `Streaming`.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// When the device was last seen by the scanner.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Record a sighting.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Characteristics currently delivering data.
    pub fn subscribed(&self) -> &[Uuid] {
        &self.subscribed
    }

    /// Replace the list of characteristics delivering data.
    pub fn set_subscribed(&mut self, characteristics: Vec<Uuid>) {
        self.subscribed = characteristics;
    }

    /// Compute the state that `event` would lead to, without applying it.
    pub fn peek(&self, event: &SessionEvent) -> Result<SessionState> {
        self.state.on(event, &self.retry, self.retry_count)
    }

    /// Enter a state obtained from [`peek`](Self::peek).
    ///
    /// The retry count increments on each entry into `Retrying` and resets on
    /// reaching `Streaming`. Leaving the link-holding states clears the
    /// subscriptions. Returns the previous state.
    pub fn enter(&mut self, next: SessionState) -> SessionState {
        match &next {
            SessionState::Retrying { .. } => self.retry_count += 1,
            SessionState::Streaming { .. } => self.retry_count = 0,
            _ => {}
        }
        if !next.holds_link() {
            self.subscribed.clear();
        }
        std::mem::replace(&mut self.state, next)
    }

    /// Apply an event. Returns the previous state.
    pub fn apply(&mut self, event: &SessionEvent) -> Result<SessionState> {
        let next = self.peek(event)?;
        Ok(self.enter(next))
    }
}
