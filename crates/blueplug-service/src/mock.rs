//! In-memory broker for testing the bridge without a network.
//!
//! [`MockBroker`] implements [`BrokerLink`]. Clones share state, so a test
//! keeps one clone to inject failures and inspect deliveries while the
//! bridge task owns another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::mqtt::{BrokerError, BrokerLink};
use crate::queue::PublishJob;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    connect_failures: VecDeque<BrokerError>,
    publish_failures: u32,
    ack_latency: Duration,
    connect_attempts: u32,
    disconnects: u32,
    delivered: Vec<PublishJob>,
}

/// A scriptable broker.
///
/// # Example
///
/// ```
/// use blueplug_service::mock::MockBroker;
/// use blueplug_service::mqtt::BrokerLink;
///
/// #[tokio::main]
/// async fn main() {
///     let broker = MockBroker::new();
///     broker.fail_next_connects(1);
///
///     let mut link = broker.clone();
///     assert!(link.connect().await.is_err());
///     assert!(link.connect().await.is_ok());
///     assert_eq!(broker.connect_attempts(), 2);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
    dropped: Arc<Notify>,
}

impl MockBroker {
    /// Create a broker that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts as unreachable.
    pub fn fail_next_connects(&self, count: u32) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state
                .connect_failures
                .push_back(BrokerError::Unreachable("connection refused".to_string()));
        }
    }

    /// Reject the next `count` connection attempts as unauthorized.
    pub fn reject_next_connects(&self, count: u32) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state
                .connect_failures
                .push_back(BrokerError::AuthRejected("NotAuthorized".to_string()));
        }
    }

    /// Fail the next `count` publishes before the broker receives them,
    /// dropping the connection each time.
    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.state).publish_failures = count;
    }

    /// Delay every confirmation.
    pub fn set_ack_latency(&self, latency: Duration) {
        lock(&self.state).ack_latency = latency;
    }

    /// Close the current connection from the broker side.
    pub fn drop_connection(&self) {
        lock(&self.state).connected = false;
        self.dropped.notify_one();
    }

    /// Jobs the broker confirmed, in order.
    pub fn delivered(&self) -> Vec<PublishJob> {
        lock(&self.state).delivered.clone()
    }

    /// Topics of the confirmed jobs, in order.
    pub fn delivered_topics(&self) -> Vec<String> {
        lock(&self.state)
            .delivered
            .iter()
            .map(|job| job.topic.clone())
            .collect()
    }

    /// Number of connection attempts so far.
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Number of clean disconnects so far.
    pub fn disconnects(&self) -> u32 {
        lock(&self.state).disconnects
    }

    /// Whether a connection is open.
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl BrokerLink for MockBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if let Some(error) = state.connect_failures.pop_front() {
            state.connected = false;
            return Err(error);
        }
        state.connected = true;
        Ok(())
    }

    async fn publish(&mut self, job: &PublishJob) -> Result<(), BrokerError> {
        let latency = {
            let mut state = lock(&self.state);
            if !state.connected {
                return Err(BrokerError::Unreachable("connection closed".to_string()));
            }
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                state.connected = false;
                return Err(BrokerError::Unreachable("connection reset".to_string()));
            }
            state.ack_latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        if !state.connected {
            return Err(BrokerError::Unreachable("connection closed".to_string()));
        }
        state.delivered.push(job.clone());
        Ok(())
    }

    async fn idle(&mut self) -> BrokerError {
        loop {
            if !lock(&self.state).connected {
                return BrokerError::Unreachable("connection closed".to_string());
            }
            self.dropped.notified().await;
        }
    }

    async fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.disconnects += 1;
        }
        state.connected = false;
    }

    fn reset(&mut self) {
        lock(&self.state).connected = false;
    }
}
