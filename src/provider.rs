//! Upstream Block Provider
//!
//! Read-only access to an Esplora-style block explorer API (mempool.space).
//! Every field of the wire types is optional or defaulted: the provider is
//! trusted for content but not for shape.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default REST base URL
pub const DEFAULT_API_BASE: &str = "https://mempool.space/api";

/// Default request timeout in milliseconds
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Errors that can occur while talking to the provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Invalid provider configuration: {0}")]
    Config(String),
}

/// Pool attribution as reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderPool {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Provider-specific block annotations
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockExtras {
    #[serde(default)]
    pub pool: Option<ProviderPool>,
}

/// Block metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub id: String,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub extras: Option<BlockExtras>,
}

impl Block {
    /// Provider pool info, if any was attached
    pub fn provider_pool(&self) -> Option<&ProviderPool> {
        self.extras.as_ref().and_then(|e| e.pool.as_ref())
    }
}

/// Entry of the recent blocks list
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSummary {
    pub id: String,
    #[serde(default)]
    pub height: u64,
}

/// Transaction input
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    #[serde(default)]
    pub scriptsig: Option<String>,
}

/// Transaction output
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    #[serde(default)]
    pub scriptpubkey: Option<String>,
    #[serde(default)]
    pub scriptpubkey_asm: Option<String>,
    #[serde(default)]
    pub scriptpubkey_type: Option<String>,
}

impl TxOutput {
    /// Whether this output carries an annotation (`OP_RETURN`) script
    pub fn is_op_return(&self) -> bool {
        self.scriptpubkey_type.as_deref() == Some("op_return")
            || self
                .scriptpubkey_asm
                .as_deref()
                .is_some_and(|asm| asm.starts_with("OP_RETURN"))
    }
}

/// Transaction with the fields the inspector needs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
}

impl Transaction {
    /// Script of the first input; for a coinbase this is the coinbase data
    pub fn first_input_script(&self) -> Option<&str> {
        self.vin
            .first()
            .and_then(|input| input.scriptsig.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Source of block and transaction data
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Block metadata by hash
    async fn block(&self, hash: &str) -> Result<Block, ProviderError>;

    /// A page of the block's transactions starting at `start_index`
    async fn block_txs(&self, hash: &str, start_index: usize) -> Result<Vec<Transaction>, ProviderError>;

    /// Most recent blocks, newest first
    async fn recent_blocks(&self) -> Result<Vec<BlockSummary>, ProviderError>;
}

/// Configuration for the HTTP provider
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

/// `BlockSource` backed by an Esplora REST API
pub struct HttpBlockSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBlockSource {
    pub fn new(cfg: HttpSourceConfig) -> Result<Self, ProviderError> {
        if cfg.base_url.trim().is_empty() {
            return Err(ProviderError::Config("base_url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Path of a transaction page; index 0 uses the bare `/txs` route
    pub fn txs_path(hash: &str, start_index: usize) -> String {
        if start_index == 0 {
            format!("/block/{hash}/txs")
        } else {
            format!("/block/{hash}/txs/{start_index}")
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = self.url(path);
        debug!("GET {}", url);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                url,
            });
        }

        resp.json::<T>().await.map_err(|e| ProviderError::Decode {
            url,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn block(&self, hash: &str) -> Result<Block, ProviderError> {
        self.get_json(&format!("/block/{hash}")).await
    }

    async fn block_txs(&self, hash: &str, start_index: usize) -> Result<Vec<Transaction>, ProviderError> {
        self.get_json(&Self::txs_path(hash, start_index)).await
    }

    async fn recent_blocks(&self) -> Result<Vec<BlockSummary>, ProviderError> {
        self.get_json("/blocks").await
    }
}
