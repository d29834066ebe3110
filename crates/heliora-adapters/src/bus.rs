//! In-process message bus.
//!
//! Topics are single-partition FIFO queues with monotonically assigned
//! offsets; the contributor topic's offset doubles as the turn id. One
//! subscriber consumes each topic sequentially, which is the ordering
//! model the whole turn engine is specified against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use heliora_core::{OracleError, Result};

/// The partition every topic lives on.
pub const PARTITION: i32 = 0;

/// One published record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

struct TopicState {
    sender: mpsc::UnboundedSender<Record>,
    receiver: Option<mpsc::UnboundedReceiver<Record>>,
    next_offset: i64,
}

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, TopicState>,
}

/// Shared handle to the bus.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher handle for a topic, creating the topic on first use.
    pub fn publisher(&self, topic: &str) -> Publisher {
        self.ensure_topic(topic);
        Publisher {
            bus: self.clone(),
            topic: topic.to_string(),
        }
    }

    /// Take the single subscription of a topic. A second take fails:
    /// one consumer per topic is part of the ordering contract.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_topic(topic);
        let mut inner = self.inner.lock().expect("bus lock");
        let state = inner.topics.get_mut(topic).expect("topic just ensured");
        let receiver = state.receiver.take().ok_or_else(|| {
            OracleError::Stream(format!("topic {topic} already has a consumer"))
        })?;
        Ok(Subscription { receiver })
    }

    fn ensure_topic(&self, topic: &str) {
        let mut inner = self.inner.lock().expect("bus lock");
        inner.topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            TopicState {
                sender,
                receiver: Some(receiver),
                next_offset: 0,
            }
        });
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<i64> {
        let mut inner = self.inner.lock().expect("bus lock");
        let state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| OracleError::Stream(format!("unknown topic {topic}")))?;
        let offset = state.next_offset;
        let record = Record {
            topic: topic.to_string(),
            partition: PARTITION,
            offset,
            payload,
        };
        state
            .sender
            .send(record)
            .map_err(|_| OracleError::Stream(format!("topic {topic} is closed")))?;
        state.next_offset += 1;
        Ok(offset)
    }
}

/// Appends records to one topic.
#[derive(Clone)]
pub struct Publisher {
    bus: MessageBus,
    topic: String,
}

impl Publisher {
    /// Publish a payload; returns the assigned offset.
    pub fn send(&self, payload: Vec<u8>) -> Result<i64> {
        self.bus.publish(&self.topic, payload)
    }

    /// Serialize a message as JSON and publish it.
    pub fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<i64> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| OracleError::Stream(format!("serialize failed: {e}")))?;
        self.send(payload)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// The single consumer of one topic.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Record>,
}

impl Subscription {
    /// Next record in offset order; `None` once every publisher is
    /// dropped and the queue drained.
    pub async fn recv(&mut self) -> Option<Record> {
        self.receiver.recv().await
    }

    /// Non-blocking variant for drain checks.
    pub fn try_recv(&mut self) -> Option<Record> {
        self.receiver.try_recv().ok()
    }
}
