//! Relay Engine
//!
//! Glue between the upstream feed, the inspector, the result store and the
//! subscriber hub. The live notification path and the on-demand scan path
//! share one dedup set, so each block hash is inspected at most once unless a
//! caller explicitly asks for a fresh check.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::inspector::{BlockInspector, MatchRecord};
use crate::publisher::{ClientRequest, RelayMessage, SubscriberHub, INVALID_REQUEST_TEXT};
use crate::store::ResultStore;
use crate::upstream::ConnectionState;

/// Statistics over the stored matches
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub total_matches: usize,
    pub processed_blocks: usize,
    pub pool_distribution: BTreeMap<String, usize>,
    pub upstream_status: String,
}

/// Liveness summary
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayHealth {
    pub upstream_connected: bool,
    pub active_subscribers: usize,
}

/// Detection-and-relay engine
pub struct Relay {
    inspector: BlockInspector,
    store: Arc<ResultStore>,
    hub: Arc<SubscriberHub>,
    upstream_state: watch::Receiver<ConnectionState>,
}

impl Relay {
    pub fn new(
        inspector: BlockInspector,
        store: Arc<ResultStore>,
        hub: Arc<SubscriberHub>,
        upstream_state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            inspector,
            store,
            hub,
            upstream_state,
        }
    }

    /// A relay with no upstream feed attached
    pub fn detached(inspector: BlockInspector, store: Arc<ResultStore>, hub: Arc<SubscriberHub>) -> Self {
        let (_, state) = watch::channel(ConnectionState::Disconnected);
        Self::new(inspector, store, hub, state)
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    pub fn upstream_state(&self) -> ConnectionState {
        *self.upstream_state.borrow()
    }

    /// Handle a block announced by the upstream feed
    ///
    /// # Returns
    /// The new match, if the block was unseen and contains the marker
    pub async fn handle_notification(&self, block_hash: &str) -> Option<MatchRecord> {
        if !self.store.record_if_new(block_hash) {
            debug!("Block {} already processed", block_hash);
            return None;
        }
        info!("New block received: {}", block_hash);

        let Some(record) = self.inspector.inspect(block_hash).await else {
            info!("Block {} checked - no SYS pattern found", block_hash);
            return None;
        };

        info!(
            "SYS found in block {} ({}) by {} at {}: {}",
            record.block_height,
            record.block_hash,
            record.pool.name,
            record.matched_where.as_str(),
            record.ascii
        );
        self.publish(&record);
        Some(record)
    }

    /// Store a match and announce it to subscribers
    fn publish(&self, record: &MatchRecord) {
        if !self.store.insert(record.clone()) {
            debug!("Match for block {} already stored", record.block_hash);
            return;
        }

        let message = RelayMessage::new_match(record.clone(), self.store.len());
        match self.hub.broadcast(&message) {
            Ok(delivered) => info!("Broadcast match to {} subscribers", delivered),
            Err(e) => warn!("Failed to broadcast match: {}", e),
        }
    }

    /// Consume block hashes until the channel closes
    pub async fn run_dispatcher(self: Arc<Self>, mut notifications: mpsc::UnboundedReceiver<String>) {
        while let Some(block_hash) = notifications.recv().await {
            self.handle_notification(&block_hash).await;
        }
        info!("Notification dispatcher stopped");
    }

    /// Inspect the most recent `limit` blocks that were not processed yet
    ///
    /// # Returns
    /// Matches found during this call, in scan order
    pub async fn scan_recent(&self, limit: usize) -> Vec<MatchRecord> {
        let blocks = match self.inspector.source().recent_blocks().await {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("Failed to list recent blocks: {}", e);
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for summary in blocks.into_iter().take(limit) {
            if !self.store.record_if_new(&summary.id) {
                continue;
            }
            if let Some(record) = self.inspector.inspect(&summary.id).await {
                self.publish(&record);
                found.push(record);
            }
        }

        info!("Scan of {} recent blocks found {} matches", limit, found.len());
        found
    }

    /// Inspect one block regardless of whether it was processed
    pub async fn check_block(&self, block_hash: &str) -> Option<MatchRecord> {
        self.inspector.inspect(block_hash).await
    }

    pub fn snapshot(&self) -> Vec<MatchRecord> {
        self.store.snapshot()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_matches: self.store.len(),
            processed_blocks: self.store.processed_count(),
            pool_distribution: self.store.pool_distribution(),
            upstream_status: self.upstream_state().to_string(),
        }
    }

    pub fn health(&self) -> RelayHealth {
        RelayHealth {
            upstream_connected: self.upstream_state().is_connected(),
            active_subscribers: self.hub.len(),
        }
    }

    /// Greeting sent to a subscriber on connect
    pub fn welcome(&self) -> RelayMessage {
        RelayMessage::welcome(self.snapshot())
    }

    /// Reply to a subscriber request frame
    pub fn handle_client_text(&self, text: &str) -> RelayMessage {
        match ClientRequest::parse(text) {
            Ok(ClientRequest::Subscribe) => RelayMessage::subscribed(),
            Ok(ClientRequest::GetResults) => RelayMessage::results(self.snapshot()),
            Err(e) => {
                debug!("Rejecting subscriber request: {}", e);
                RelayMessage::error(INVALID_REQUEST_TEXT)
            }
        }
    }
}
