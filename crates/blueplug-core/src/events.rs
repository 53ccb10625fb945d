//! Session health reports.
//!
//! Session tasks report back to the coordinator over an unbounded channel.
//! Reports are serializable so they can be logged as structured data.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::session::{AbandonReason, SessionState};

/// Coarse session phase, without the per-state details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Discovered,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Streaming,
    Disconnected,
    Retrying,
    Abandoned,
}

impl From<&SessionState> for SessionPhase {
    fn from(state: &SessionState) -> Self {
        match state {
            SessionState::Discovered => Self::Discovered,
            SessionState::Connecting { .. } => Self::Connecting,
            SessionState::ServiceDiscovery => Self::ServiceDiscovery,
            SessionState::Subscribing { .. } => Self::Subscribing,
            SessionState::Streaming { .. } => Self::Streaming,
            SessionState::Disconnected { .. } => Self::Disconnected,
            SessionState::Retrying { .. } => Self::Retrying,
            SessionState::Abandoned { .. } => Self::Abandoned,
        }
    }
}

/// Reports emitted by session tasks.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new report types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionReport {
    /// The session changed state.
    StateChanged {
        device: DeviceIdentity,
        from: SessionPhase,
        to: SessionPhase,
        retry_count: u32,
    },
    /// A characteristic could not be subscribed or read and was excluded.
    CharacteristicFailed {
        device: DeviceIdentity,
        characteristic: Uuid,
        error: String,
    },
    /// A payload could not be decoded. The session keeps streaming.
    DecodeFailed {
        device: DeviceIdentity,
        characteristic: Uuid,
        error: String,
    },
    /// The session ended. The identity may be admitted again later.
    Abandoned {
        device: DeviceIdentity,
        reason: AbandonReason,
    },
}

impl SessionReport {
    /// Device the report is about.
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            Self::StateChanged { device, .. }
            | Self::CharacteristicFailed { device, .. }
            | Self::DecodeFailed { device, .. }
            | Self::Abandoned { device, .. } => device,
        }
    }
}

/// Sender half of the report channel.
pub type ReportSender = mpsc::UnboundedSender<SessionReport>;

/// Receiver half of the report channel.
pub type ReportReceiver = mpsc::UnboundedReceiver<SessionReport>;

/// Create a report channel.
pub fn report_channel() -> (ReportSender, ReportReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_report_serialization() {
        let report = SessionReport::StateChanged {
            device: DeviceIdentity::new("aa:bb"),
            from: SessionPhase::Subscribing,
            to: SessionPhase::Streaming,
            retry_count: 0,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""type":"state_changed""#));
        assert!(json.contains(r#""to":"streaming""#));
        assert!(json.contains(r#""device":"AA:BB""#));

        let back: SessionReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_abandoned_serialization() {
        let report = SessionReport::Abandoned {
            device: DeviceIdentity::new("AA"),
            reason: AbandonReason::RetriesExhausted,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""reason":"retries_exhausted""#));
        assert_eq!(report.device().as_str(), "AA");
    }

    #[test]
    fn test_phase_from_state() {
        let state = SessionState::Retrying {
            attempt: 1,
            delay: Duration::from_secs(1),
        };
        assert_eq!(SessionPhase::from(&state), SessionPhase::Retrying);
    }
}
