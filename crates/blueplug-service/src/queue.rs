//! Bounded FIFO of publish jobs waiting for the broker.

use std::collections::VecDeque;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

/// One MQTT message derived from a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJob {
    /// Full topic.
    pub topic: String,
    /// Message body.
    pub payload: Vec<u8>,
    /// Delivery guarantee requested from the broker.
    pub qos: QoS,
    /// Whether the broker keeps the message for late subscribers.
    pub retain: bool,
}

/// What to do when a job arrives and the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the job at the head to make room for the new one.
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the new job.
    DropNewest,
}

/// Queue holding jobs while the broker is unreachable.
///
/// Jobs leave the queue in arrival order. Every job discarded because of the
/// capacity limit is counted in [`dropped`](Self::dropped).
#[derive(Debug)]
pub struct OutageQueue {
    jobs: VecDeque<PublishJob>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: u64,
}

impl OutageQueue {
    /// Create an empty queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            jobs: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
            dropped: 0,
        }
    }

    /// Append a job, applying the overflow policy when full.
    ///
    /// Returns the job that was discarded, if any.
    pub fn push(&mut self, job: PublishJob) -> Option<PublishJob> {
        if self.jobs.len() < self.capacity {
            self.jobs.push_back(job);
            return None;
        }

        self.dropped += 1;
        match self.policy {
            OverflowPolicy::DropOldest => {
                let evicted = self.jobs.pop_front();
                self.jobs.push_back(job);
                evicted
            }
            OverflowPolicy::DropNewest => Some(job),
        }
    }

    /// The next job to deliver.
    pub fn front(&self) -> Option<&PublishJob> {
        self.jobs.front()
    }

    /// Remove the head job after it was delivered.
    pub fn pop_front(&mut self) -> Option<PublishJob> {
        self.jobs.pop_front()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Maximum number of queued jobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Iterate over queued jobs, head first.
    pub fn iter(&self) -> impl Iterator<Item = &PublishJob> {
        self.jobs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(topic: &str) -> PublishJob {
        PublishJob {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    fn topics(queue: &OutageQueue) -> Vec<&str> {
        queue.iter().map(|j| j.topic.as_str()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutageQueue::new(10, OverflowPolicy::DropOldest);
        queue.push(job("a"));
        queue.push(job("b"));
        queue.push(job("c"));

        assert_eq!(queue.pop_front().map(|j| j.topic), Some("a".to_string()));
        assert_eq!(queue.front().map(|j| j.topic.as_str()), Some("b"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let mut queue = OutageQueue::new(2, OverflowPolicy::DropOldest);
        assert!(queue.push(job("a")).is_none());
        assert!(queue.push(job("b")).is_none());

        let evicted = queue.push(job("c"));
        assert_eq!(evicted.map(|j| j.topic), Some("a".to_string()));
        assert_eq!(topics(&queue), ["b", "c"]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_drop_newest_when_full() {
        let mut queue = OutageQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(job("a"));
        queue.push(job("b"));

        let rejected = queue.push(job("c"));
        assert_eq!(rejected.map(|j| j.topic), Some("c".to_string()));
        assert_eq!(topics(&queue), ["a", "b"]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_drops_accumulate() {
        let mut queue = OutageQueue::new(1, OverflowPolicy::DropOldest);
        for i in 0..5 {
            queue.push(job(&i.to_string()));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dropped(), 4);
        assert_eq!(topics(&queue), ["4"]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let queue = OutageQueue::new(0, OverflowPolicy::DropOldest);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_queue_keeps_newest_in_order(capacity in 1usize..16, pushes in 0usize..64) {
            let mut queue = OutageQueue::new(capacity, OverflowPolicy::DropOldest);
            for i in 0..pushes {
                queue.push(job(&i.to_string()));
            }

            let kept = pushes.min(capacity);
            prop_assert_eq!(queue.len(), kept);
            prop_assert_eq!(queue.dropped() as usize, pushes - kept);
            let expected: Vec<String> = (pushes - kept..pushes).map(|i| i.to_string()).collect();
            prop_assert_eq!(topics(&queue), expected);
        }

        #[test]
        fn prop_drop_newest_keeps_first_arrivals(capacity in 1usize..16, pushes in 0usize..64) {
            let mut queue = OutageQueue::new(capacity, OverflowPolicy::DropNewest);
            for i in 0..pushes {
                queue.push(job(&i.to_string()));
            }

            let kept = pushes.min(capacity);
            prop_assert_eq!(queue.dropped() as usize, pushes - kept);
            let expected: Vec<String> = (0..kept).map(|i| i.to_string()).collect();
            prop_assert_eq!(topics(&queue), expected);
        }
    }

    #[test]
    fn test_policy_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            overflow: OverflowPolicy,
        }
        let w: Wrapper = toml::from_str(r#"overflow = "drop-newest""#).unwrap();
        assert_eq!(w.overflow, OverflowPolicy::DropNewest);
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::DropOldest);
    }
}
