//! Subscriber Publisher
//!
//! Relay protocol messages and the fan-out hub that delivers them to
//! downstream subscribers. Each subscriber owns a bounded outbound queue;
//! broadcasting never waits on any of them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::inspector::MatchRecord;

/// Outbound queue depth per subscriber
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

pub const WELCOME_TEXT: &str = "Connected to SYS blocks filter - receiving ONLY blocks containing SYS pattern";
pub const WELCOME_DESCRIPTION: &str =
    "Bitcoin blocks are filtered as they arrive and only blocks containing \"SYS\" are relayed";
pub const SUBSCRIBED_TEXT: &str = "Successfully subscribed to SYS blocks updates";
pub const INVALID_REQUEST_TEXT: &str = "Invalid JSON message";

/// Errors that can occur while publishing to one subscriber
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscriber {0} is gone")]
    SubscriberGone(SubscriberId),

    #[error("Subscriber {0} queue is full")]
    QueueFull(SubscriberId),
}

/// Server-to-subscriber message body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MessageKind {
    Welcome {
        message: String,
        description: String,
        current_results: Vec<MatchRecord>,
        total_results: usize,
    },
    Subscribed {
        message: String,
    },
    Results {
        results: Vec<MatchRecord>,
        total_results: usize,
    },
    NewMatch {
        result: MatchRecord,
        total_results: usize,
    },
    Error {
        message: String,
    },
}

/// Server-to-subscriber message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayMessage {
    #[serde(flatten)]
    pub kind: MessageKind,
    /// Unix timestamp in milliseconds when the message was created
    pub timestamp: u64,
}

impl RelayMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            timestamp: current_timestamp_millis(),
        }
    }

    pub fn welcome(results: Vec<MatchRecord>) -> Self {
        let total_results = results.len();
        Self::new(MessageKind::Welcome {
            message: WELCOME_TEXT.to_string(),
            description: WELCOME_DESCRIPTION.to_string(),
            current_results: results,
            total_results,
        })
    }

    pub fn subscribed() -> Self {
        Self::new(MessageKind::Subscribed {
            message: SUBSCRIBED_TEXT.to_string(),
        })
    }

    pub fn results(results: Vec<MatchRecord>) -> Self {
        let total_results = results.len();
        Self::new(MessageKind::Results { results, total_results })
    }

    pub fn new_match(result: MatchRecord, total_results: usize) -> Self {
        Self::new(MessageKind::NewMatch { result, total_results })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageKind::Error {
            message: message.into(),
        })
    }

    /// The `type` tag of this message
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::Welcome { .. } => "welcome",
            MessageKind::Subscribed { .. } => "subscribed",
            MessageKind::Results { .. } => "results",
            MessageKind::NewMatch { .. } => "new_match",
            MessageKind::Error { .. } => "error",
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Subscriber-to-server request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe,
    #[serde(alias = "get_blocks")]
    GetResults,
}

impl ClientRequest {
    /// Parse a request frame; unknown actions are errors
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identifier of a registered subscriber
pub type SubscriberId = u64;

/// Handle returned when a subscriber registers
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    /// Serialized messages addressed to this subscriber
    pub receiver: mpsc::Receiver<String>,
}

/// Fan-out registry of live subscribers
#[derive(Debug)]
pub struct SubscriberHub {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::with_queue_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<String>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber
    pub fn register(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.lock().insert(id, sender);
        debug!("Subscriber {} registered", id);
        Subscription { id, receiver }
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!("Subscriber {} removed", id);
        }
        removed
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Queue a message for a single subscriber
    pub fn send_to(&self, id: SubscriberId, message: &RelayMessage) -> Result<(), PublishError> {
        let json = message.to_json()?;
        let mut subscribers = self.lock();
        let Some(sender) = subscribers.get(&id) else {
            return Err(PublishError::SubscriberGone(id));
        };
        match sender.try_send(json) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PublishError::QueueFull(id)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                subscribers.remove(&id);
                Err(PublishError::SubscriberGone(id))
            }
        }
    }

    /// Queue a message for every live subscriber
    ///
    /// Closed subscribers are dropped from the registry; a full queue only
    /// loses this message for that subscriber.
    ///
    /// # Returns
    /// The number of subscribers the message was queued for
    pub fn broadcast(&self, message: &RelayMessage) -> Result<usize, PublishError> {
        let json = message.to_json()?;
        let mut delivered = 0;

        self.lock().retain(|id, sender| match sender.try_send(json.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Subscriber {} is lagging, dropping {} message", id, message.kind_name());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Subscriber {} closed, removing", id);
                false
            }
        });

        Ok(delivered)
    }
}
