//! Block Inspector
//!
//! Fetches a block from the provider and looks for the marker, in priority
//! order: coinbase scriptSig, coinbase `OP_RETURN` outputs, then the `OP_RETURN`
//! outputs of the remaining transactions (paginated and capped).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::filter::{attribute_pool, contains_marker, pool_icon_url, PoolInfo, DEFAULT_LOGO_BASE};
use crate::provider::{Block, BlockSource, ProviderError, Transaction};
use crate::script::{bytes_to_visible_ascii, extract_op_return, visible_ascii};

/// Transactions per provider page
pub const PAGE_SIZE: usize = 25;

/// Pages scanned after the coinbase page
pub const MAX_EXTRA_PAGES: usize = 9;

/// Where in the block the marker was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchLocation {
    #[serde(rename = "coinbase_scriptSig")]
    CoinbaseScriptSig,
    #[serde(rename = "coinbase_OP_RETURN")]
    CoinbaseOpReturn,
    #[serde(rename = "OP_RETURN")]
    OpReturn,
}

impl MatchLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchLocation::CoinbaseScriptSig => "coinbase_scriptSig",
            MatchLocation::CoinbaseOpReturn => "coinbase_OP_RETURN",
            MatchLocation::OpReturn => "OP_RETURN",
        }
    }
}

/// A block containing the marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub block_height: u64,
    pub block_hash: String,
    /// Block time in unix seconds
    pub timestamp: i64,
    pub pool: PoolInfo,
    pub matched_where: MatchLocation,
    pub matched_txid: String,
    pub data_hex: String,
    pub ascii: String,
}

/// Marker found inside one transaction's outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMatch {
    pub data_hex: String,
    pub ascii: String,
}

/// Errors that abort an inspection
#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Block {0} has no coinbase transaction")]
    MissingCoinbase(String),
}

/// Scan a transaction's outputs for an `OP_RETURN` payload containing the marker
///
/// # Returns
/// The first `OP_RETURN` output whose payload contains the marker
pub fn find_marker_in_outputs(tx: &Transaction) -> Option<OutputMatch> {
    tx.vout
        .iter()
        .filter(|out| out.is_op_return())
        .filter_map(|out| out.scriptpubkey.as_deref().and_then(extract_op_return))
        .find_map(|payload| {
            let data_hex = hex::encode(&payload);
            contains_marker(&data_hex).then(|| OutputMatch {
                ascii: visible_ascii(&payload),
                data_hex,
            })
        })
}

/// Inspector settings
#[derive(Debug, Clone)]
pub struct InspectorConfig {
    pub logo_base: String,
    pub page_size: usize,
    pub max_extra_pages: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            logo_base: DEFAULT_LOGO_BASE.to_string(),
            page_size: PAGE_SIZE,
            max_extra_pages: MAX_EXTRA_PAGES,
        }
    }
}

/// Runs marker detection against blocks from a [`BlockSource`]
#[derive(Clone)]
pub struct BlockInspector {
    source: Arc<dyn BlockSource>,
    config: InspectorConfig,
}

impl BlockInspector {
    pub fn new(source: Arc<dyn BlockSource>, config: InspectorConfig) -> Self {
        Self { source, config }
    }

    pub fn with_default_config(source: Arc<dyn BlockSource>) -> Self {
        Self::new(source, InspectorConfig::default())
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    /// Inspect a block, treating every failure as "no match"
    pub async fn inspect(&self, block_hash: &str) -> Option<MatchRecord> {
        match self.try_inspect(block_hash).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Inspection of block {} failed: {}", block_hash, e);
                None
            }
        }
    }

    /// Inspect a block, surfacing provider failures
    pub async fn try_inspect(&self, block_hash: &str) -> Result<Option<MatchRecord>, InspectError> {
        let block = self.source.block(block_hash).await?;
        let first_page = self.source.block_txs(block_hash, 0).await?;
        let coinbase = first_page
            .into_iter()
            .next()
            .ok_or_else(|| InspectError::MissingCoinbase(block_hash.to_string()))?;

        let pool = self.resolve_pool(&block, &coinbase);
        let record = |matched_where, tx: &Transaction, data_hex: String, ascii: String| MatchRecord {
            block_height: block.height,
            block_hash: block.id.clone(),
            timestamp: block.timestamp,
            pool: pool.clone(),
            matched_where,
            matched_txid: tx.txid.clone(),
            data_hex,
            ascii,
        };

        if let Some(script_sig) = coinbase.first_input_script() {
            if contains_marker(script_sig) {
                return Ok(Some(record(
                    MatchLocation::CoinbaseScriptSig,
                    &coinbase,
                    script_sig.to_string(),
                    bytes_to_visible_ascii(script_sig),
                )));
            }
        }

        if let Some(found) = find_marker_in_outputs(&coinbase) {
            return Ok(Some(record(MatchLocation::CoinbaseOpReturn, &coinbase, found.data_hex, found.ascii)));
        }

        for page in 1..=self.config.max_extra_pages {
            let start_index = page * self.config.page_size;
            let txs = match self.source.block_txs(block_hash, start_index).await {
                Ok(txs) => txs,
                Err(e) => {
                    debug!("Stopping scan of {} at index {}: {}", block_hash, start_index, e);
                    break;
                }
            };
            if txs.is_empty() {
                break;
            }

            for tx in &txs {
                if let Some(found) = find_marker_in_outputs(tx) {
                    return Ok(Some(record(MatchLocation::OpReturn, tx, found.data_hex, found.ascii)));
                }
            }
        }

        Ok(None)
    }

    /// Provider attribution if complete, else scriptSig patterns, else Unknown
    pub fn resolve_pool(&self, block: &Block, coinbase: &Transaction) -> PoolInfo {
        let logo_base = &self.config.logo_base;

        if let Some(pool) = block.provider_pool() {
            if let (Some(name), Some(slug)) = (pool.name.as_deref(), pool.slug.as_deref()) {
                let icon = pool
                    .icon
                    .clone()
                    .filter(|icon| !icon.is_empty())
                    .unwrap_or_else(|| pool_icon_url(logo_base, slug));
                return PoolInfo {
                    name: name.to_string(),
                    slug: slug.to_string(),
                    icon,
                };
            }
        }

        coinbase
            .first_input_script()
            .and_then(attribute_pool)
            .map(|found| found.into_pool_info(logo_base))
            .unwrap_or_else(|| PoolInfo::unknown(logo_base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BlockExtras, MockBlockSource, ProviderPool, TxInput, TxOutput};
    use tokio_test::block_on;

    const HASH: &str = "00000000000000000000f00d";

    fn block() -> Block {
        Block {
            id: HASH.to_string(),
            height: 880_000,
            timestamp: 1_737_000_000,
            extras: None,
        }
    }

    fn op_return(script: &str) -> TxOutput {
        TxOutput {
            scriptpubkey: Some(script.to_string()),
            scriptpubkey_asm: None,
            scriptpubkey_type: Some("op_return".to_string()),
        }
    }

    fn p2wpkh() -> TxOutput {
        TxOutput {
            scriptpubkey: Some("0014".to_string() + &"ab".repeat(20)),
            scriptpubkey_asm: Some("OP_0 OP_PUSHBYTES_20 abab".to_string()),
            scriptpubkey_type: Some("v0_p2wpkh".to_string()),
        }
    }

    fn tx(txid: &str, scriptsig: Option<&str>, vout: Vec<TxOutput>) -> Transaction {
        Transaction {
            txid: txid.to_string(),
            vin: vec![TxInput { scriptsig: scriptsig.map(str::to_string) }],
            vout,
        }
    }

    fn plain_coinbase() -> Transaction {
        tx("coinbase", Some("03a0bb0d2f736f6c6f2f"), vec![p2wpkh()])
    }

    fn inspector(source: MockBlockSource) -> BlockInspector {
        BlockInspector::with_default_config(Arc::new(source))
    }

    // ==================== find_marker_in_outputs tests ====================

    #[test]
    fn test_find_marker_in_op_return_output() {
        let t = tx("t", None, vec![p2wpkh(), op_return("6a07737973636f696e")]);
        let found = find_marker_in_outputs(&t).unwrap();
        assert_eq!(found.data_hex, "737973636f696e");
        assert_eq!(found.ascii, "syscoin");
    }

    #[test]
    fn test_find_marker_ignores_non_op_return_outputs() {
        // Marker bytes inside a non-annotation output are not considered
        let mut out = p2wpkh();
        out.scriptpubkey = Some("6a03737973".to_string());
        let t = tx("t", None, vec![out]);
        assert_eq!(find_marker_in_outputs(&t), None);
    }

    #[test]
    fn test_find_marker_checks_every_op_return_output() {
        let t = tx("t", None, vec![op_return("6a0568656c6c6f"), op_return("6a03737973")]);
        assert_eq!(find_marker_in_outputs(&t).unwrap().data_hex, "737973");
    }

    #[test]
    fn test_find_marker_first_matching_output_wins() {
        let t = tx("t", None, vec![op_return("6a03737973"), op_return("6a07737973636f696e")]);
        assert_eq!(find_marker_in_outputs(&t).unwrap().ascii, "sys");
    }

    #[test]
    fn test_find_marker_skips_op_return_without_payload() {
        let t = tx("t", None, vec![op_return("6a"), op_return("6a03737973")]);
        assert_eq!(find_marker_in_outputs(&t).unwrap().ascii, "sys");
    }

    // ==================== MatchRecord serialization tests ====================

    #[test]
    fn test_match_record_json_field_names() {
        let record = MatchRecord {
            block_height: 1,
            block_hash: "h".to_string(),
            timestamp: 2,
            pool: PoolInfo::unknown(DEFAULT_LOGO_BASE),
            matched_where: MatchLocation::CoinbaseOpReturn,
            matched_txid: "t".to_string(),
            data_hex: "737973".to_string(),
            ascii: "sys".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["blockHeight"], 1);
        assert_eq!(json["blockHash"], "h");
        assert_eq!(json["matchedWhere"], "coinbase_OP_RETURN");
        assert_eq!(json["matchedTxid"], "t");
        assert_eq!(json["dataHex"], "737973");
        assert_eq!(json["pool"]["slug"], "unknown");
    }

    #[test]
    fn test_match_location_names() {
        for loc in [MatchLocation::CoinbaseScriptSig, MatchLocation::CoinbaseOpReturn, MatchLocation::OpReturn] {
            assert_eq!(serde_json::to_value(loc).unwrap(), loc.as_str());
        }
    }

    // ==================== inspect tests ====================

    #[test]
    fn test_inspect_coinbase_op_return_syscoin() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source.expect_block_txs().withf(|_, start| *start == 0).returning(|_, _| {
            Ok(vec![tx("cb", Some("03a0bb0d"), vec![op_return("6a07737973636f696e"), p2wpkh()])])
        });

        let record = block_on(inspector(source).inspect(HASH)).unwrap();
        assert_eq!(record.matched_where, MatchLocation::CoinbaseOpReturn);
        assert_eq!(record.data_hex, "737973636f696e");
        assert!(record.ascii.contains("syscoin"));
        assert_eq!(record.matched_txid, "cb");
        assert_eq!(record.block_height, 880_000);
        assert_eq!(record.block_hash, HASH);
        assert_eq!(record.timestamp, 1_737_000_000);
    }

    #[test]
    fn test_inspect_script_sig_wins_over_op_return() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source.expect_block_txs().withf(|_, start| *start == 0).returning(|_, _| {
            Ok(vec![tx("cb", Some("03a0bb0d737973"), vec![op_return("6a07737973636f696e")])])
        });

        let record = block_on(inspector(source).inspect(HASH)).unwrap();
        assert_eq!(record.matched_where, MatchLocation::CoinbaseScriptSig);
        assert_eq!(record.data_hex, "03a0bb0d737973");
        assert_eq!(record.ascii, "....sys");
    }

    #[test]
    fn test_inspect_script_sig_match_is_case_insensitive() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source
            .expect_block_txs()
            .returning(|_, _| Ok(vec![tx("cb", Some("03A0BB0D737973"), vec![])]));

        let record = block_on(inspector(source).inspect(HASH)).unwrap();
        assert_eq!(record.matched_where, MatchLocation::CoinbaseScriptSig);
    }

    #[test]
    fn test_inspect_finds_match_in_later_page() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source.expect_block_txs().returning(|_, start| match start {
            0 => Ok(vec![plain_coinbase()]),
            25 => Ok(vec![tx("a", None, vec![p2wpkh()])]),
            50 => Ok(vec![tx("b", None, vec![p2wpkh()]), tx("c", None, vec![op_return("6a0a737973636f696e2d3031")])]),
            _ => panic!("unexpected page {start}"),
        });

        let record = block_on(inspector(source).inspect(HASH)).unwrap();
        assert_eq!(record.matched_where, MatchLocation::OpReturn);
        assert_eq!(record.matched_txid, "c");
        assert_eq!(record.ascii, "syscoin-01");
    }

    #[test]
    fn test_inspect_caps_pagination() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source
            .expect_block_txs()
            .withf(|_, start| *start == 0)
            .times(1)
            .returning(|_, _| Ok(vec![plain_coinbase()]));
        source
            .expect_block_txs()
            .withf(|_, start| *start > 0 && *start <= 225 && start % 25 == 0)
            .times(9)
            .returning(|_, start| Ok(vec![tx(&format!("t{start}"), None, vec![p2wpkh()])]));

        assert_eq!(block_on(inspector(source).inspect(HASH)), None);
    }

    #[test]
    fn test_inspect_stops_on_empty_page() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source
            .expect_block_txs()
            .withf(|_, start| *start == 0)
            .returning(|_, _| Ok(vec![plain_coinbase()]));
        source
            .expect_block_txs()
            .withf(|_, start| *start == 25)
            .times(1)
            .returning(|_, _| Ok(vec![]));

        assert_eq!(block_on(inspector(source).inspect(HASH)), None);
    }

    #[test]
    fn test_inspect_page_error_ends_scan_softly() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source
            .expect_block_txs()
            .withf(|_, start| *start == 0)
            .returning(|_, _| Ok(vec![plain_coinbase()]));
        source
            .expect_block_txs()
            .withf(|_, start| *start == 25)
            .times(1)
            .returning(|_, _| Err(ProviderError::Config("boom".to_string())));

        let result = block_on(inspector(source).try_inspect(HASH));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_inspect_block_error_is_no_match() {
        let mut source = MockBlockSource::new();
        source
            .expect_block()
            .returning(|_| Err(ProviderError::Status { status: 404, url: "u".to_string() }));
        source.expect_block_txs().never();

        let insp = inspector(source);
        assert!(matches!(block_on(insp.try_inspect(HASH)), Err(InspectError::Provider(_))));
        assert_eq!(block_on(insp.inspect(HASH)), None);
    }

    #[test]
    fn test_inspect_missing_coinbase_is_no_match() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source.expect_block_txs().returning(|_, _| Ok(vec![]));

        let insp = inspector(source);
        assert!(matches!(block_on(insp.try_inspect(HASH)), Err(InspectError::MissingCoinbase(_))));
        assert_eq!(block_on(insp.inspect(HASH)), None);
    }

    // ==================== resolve_pool tests ====================

    #[test]
    fn test_resolve_pool_prefers_provider() {
        let insp = inspector(MockBlockSource::new());
        let mut b = block();
        b.extras = Some(BlockExtras {
            pool: Some(ProviderPool {
                name: Some("ViaBTC".to_string()),
                slug: Some("viabtc".to_string()),
                icon: None,
            }),
        });
        let coinbase = tx("cb", Some(hex::encode("/AntPool/").as_str()), vec![]);

        let pool = insp.resolve_pool(&b, &coinbase);
        assert_eq!(pool.name, "ViaBTC");
        assert_eq!(pool.icon, format!("{}/viabtc.svg", DEFAULT_LOGO_BASE));
    }

    #[test]
    fn test_resolve_pool_keeps_provider_icon() {
        let insp = inspector(MockBlockSource::new());
        let mut b = block();
        b.extras = Some(BlockExtras {
            pool: Some(ProviderPool {
                name: Some("Luxor".to_string()),
                slug: Some("luxor".to_string()),
                icon: Some("https://cdn.example/luxor.png".to_string()),
            }),
        });

        let pool = insp.resolve_pool(&b, &plain_coinbase());
        assert_eq!(pool.icon, "https://cdn.example/luxor.png");
    }

    #[test]
    fn test_resolve_pool_incomplete_provider_falls_back_to_script_sig() {
        let insp = inspector(MockBlockSource::new());
        let mut b = block();
        b.extras = Some(BlockExtras {
            pool: Some(ProviderPool {
                name: Some("Something".to_string()),
                slug: None,
                icon: None,
            }),
        });
        let coinbase = tx("cb", Some(hex::encode("Mined by AntPool").as_str()), vec![]);

        let pool = insp.resolve_pool(&b, &coinbase);
        assert_eq!(pool.name, "AntPool");
        assert_eq!(pool.slug, "antpool");
        assert_eq!(pool.icon, format!("{}/antpool.svg", DEFAULT_LOGO_BASE));
    }

    #[test]
    fn test_resolve_pool_unknown_default() {
        let insp = inspector(MockBlockSource::new());
        let pool = insp.resolve_pool(&block(), &plain_coinbase());
        assert_eq!(pool, PoolInfo::unknown(DEFAULT_LOGO_BASE));
    }

    #[test]
    fn test_inspect_attaches_attributed_pool() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|_| Ok(block()));
        source.expect_block_txs().returning(|_, _| {
            let script = format!("03a0bb0d{}", hex::encode("/F2Pool/"));
            Ok(vec![tx("cb", Some(script.as_str()), vec![op_return("6a03737973")])])
        });

        let record = block_on(inspector(source).inspect(HASH)).unwrap();
        assert_eq!(record.pool.slug, "f2pool");
        assert_eq!(record.matched_where, MatchLocation::CoinbaseOpReturn);
    }
}
