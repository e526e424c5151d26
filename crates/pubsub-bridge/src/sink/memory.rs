//! Programmable in-process transport.
//!
//! Records every accepted message and can be told to fail, stall or reject
//! specific messages, so the engine can be exercised without Pub/Sub.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{PublishTransport, SinkStatus, TransportError};
use crate::mapper::{ATTR_SOURCE_OFFSET, ATTR_SOURCE_PARTITION};
use crate::record::PublishRequest;

type RejectFn = Box<dyn Fn(&PublishRequest) -> bool + Send + Sync>;

/// A message accepted by [`InMemoryTransport`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub message_id: String,
    pub request: PublishRequest,
}

impl PublishedMessage {
    /// Source partition and offset, read from the default mapper's attributes.
    pub fn source_position(&self) -> Option<(u32, u64)> {
        let partition = self.request.attributes.get(ATTR_SOURCE_PARTITION)?.parse().ok()?;
        let offset = self.request.attributes.get(ATTR_SOURCE_OFFSET)?.parse().ok()?;
        Some((partition, offset))
    }
}

#[derive(Default)]
struct State {
    messages: Vec<PublishedMessage>,
    next_id: u64,
    calls: usize,
    batch_sizes: Vec<usize>,
    active: usize,
    max_active: usize,
    fail_next: VecDeque<SinkStatus>,
    outage: Option<SinkStatus>,
    rejections: Vec<RejectFn>,
}

/// [`PublishTransport`] that keeps messages in memory.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    latency: Duration,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every publish call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls with `status`.
    pub fn fail_next(&self, status: SinkStatus, times: usize) {
        let mut state = self.state();
        for _ in 0..times {
            state.fail_next.push_back(status);
        }
    }

    /// Fail every call with `status` until cleared with `None`.
    pub fn set_outage(&self, status: Option<SinkStatus>) {
        self.state().outage = status;
    }

    /// Reject, with `INVALID_ARGUMENT`, any batch containing a matching message.
    pub fn reject_when<F>(&self, predicate: F)
    where
        F: Fn(&PublishRequest) -> bool + Send + Sync + 'static,
    {
        self.state().rejections.push(Box::new(predicate));
    }

    /// Every accepted message, in acceptance order.
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.state().messages.clone()
    }

    /// Source offsets accepted for `partition`, in acceptance order.
    pub fn offsets_for(&self, partition: u32) -> Vec<u64> {
        self.state()
            .messages
            .iter()
            .filter_map(|m| m.source_position())
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| o)
            .collect()
    }

    /// Number of publish calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.state().calls
    }

    /// Sizes of accepted batches.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batch_sizes.clone()
    }

    /// Highest number of concurrent publish calls seen.
    pub fn max_concurrent_calls(&self) -> usize {
        self.state().max_active
    }
}

#[async_trait]
impl PublishTransport for InMemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        messages: &[PublishRequest],
    ) -> Result<Vec<String>, TransportError> {
        {
            let mut state = self.state();
            state.calls += 1;
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state();
        state.active -= 1;

        if let Some(status) = state.fail_next.pop_front() {
            return Err(TransportError::new(status, "injected failure"));
        }
        if let Some(status) = state.outage {
            return Err(TransportError::new(status, "injected outage"));
        }
        let rejected = messages
            .iter()
            .any(|m| state.rejections.iter().any(|reject| reject(m)));
        if rejected {
            return Err(TransportError::new(
                SinkStatus::InvalidArgument,
                "message rejected",
            ));
        }

        let mut ids = Vec::with_capacity(messages.len());
        for request in messages {
            state.next_id += 1;
            let message_id = state.next_id.to_string();
            ids.push(message_id.clone());
            state.messages.push(PublishedMessage {
                topic: topic.to_string(),
                message_id,
                request: request.clone(),
            });
        }
        state.batch_sizes.push(messages.len());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(partition: u32, offset: u64) -> PublishRequest {
        let mut req = PublishRequest::new("x");
        req.attributes
            .insert(ATTR_SOURCE_PARTITION.to_string(), partition.to_string());
        req.attributes
            .insert(ATTR_SOURCE_OFFSET.to_string(), offset.to_string());
        req
    }

    #[tokio::test]
    async fn test_records_messages_and_ids() {
        let transport = InMemoryTransport::new();
        let ids = transport
            .publish("projects/p/topics/t", &[request(0, 1), request(0, 2)])
            .await
            .unwrap();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(transport.offsets_for(0), vec![1, 2]);
        assert_eq!(transport.batch_sizes(), vec![2]);
        assert_eq!(transport.messages()[0].topic, "projects/p/topics/t");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let transport = InMemoryTransport::new();
        transport.fail_next(SinkStatus::Unavailable, 2);
        assert!(transport.publish("t", &[request(0, 0)]).await.is_err());
        assert!(transport.publish("t", &[request(0, 0)]).await.is_err());
        assert!(transport.publish("t", &[request(0, 0)]).await.is_ok());
        assert_eq!(transport.calls(), 3);

        transport.set_outage(Some(SinkStatus::Internal));
        let err = transport.publish("t", &[request(0, 1)]).await.unwrap_err();
        assert_eq!(err.status, SinkStatus::Internal);
        transport.set_outage(None);
        assert!(transport.publish("t", &[request(0, 1)]).await.is_ok());
    }

    #[tokio::test]
    async fn test_reject_when() {
        let transport = InMemoryTransport::new();
        transport.reject_when(|r| r.attributes.get(ATTR_SOURCE_OFFSET).map(String::as_str) == Some("7"));
        let err = transport
            .publish("t", &[request(0, 6), request(0, 7)])
            .await
            .unwrap_err();
        assert_eq!(err.status, SinkStatus::InvalidArgument);
        assert!(transport.messages().is_empty());
        assert!(transport.publish("t", &[request(0, 6)]).await.is_ok());
    }
}
