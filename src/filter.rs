//! Marker and Pool Filtering
//!
//! Detects the "sys" marker in script hex and attributes coinbase scripts to
//! mining pools via an ordered table of name patterns.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::script::bytes_to_visible_ascii;

/// Marker text we look for
pub const MARKER_TEXT: &str = "sys";

/// Hex encoding of [`MARKER_TEXT`]
pub const MARKER_HEX: &str = "737973";

/// Default base URL for pool icons
pub const DEFAULT_LOGO_BASE: &str = "https://raw.githubusercontent.com/mempool/mining-pool-logos/master";

/// Name and slug reported for blocks we cannot attribute
pub const UNKNOWN_POOL_NAME: &str = "Unknown";
pub const UNKNOWN_POOL_SLUG: &str = "unknown";

/// Mining pool attribution attached to every match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub slug: String,
    pub icon: String,
}

impl PoolInfo {
    /// Build a pool entry whose icon is derived from its slug
    pub fn with_derived_icon(name: impl Into<String>, slug: impl Into<String>, logo_base: &str) -> Self {
        let slug = slug.into();
        Self {
            name: name.into(),
            icon: pool_icon_url(logo_base, &slug),
            slug,
        }
    }

    /// The fallback used when no attribution succeeds
    pub fn unknown(logo_base: &str) -> Self {
        Self {
            name: UNKNOWN_POOL_NAME.to_string(),
            slug: UNKNOWN_POOL_SLUG.to_string(),
            icon: default_icon_url(logo_base),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.slug == UNKNOWN_POOL_SLUG
    }
}

/// Icon location for a pool slug
pub fn pool_icon_url(logo_base: &str, slug: &str) -> String {
    format!("{}/{}.svg", logo_base.trim_end_matches('/'), slug)
}

/// Icon location for unattributed blocks
pub fn default_icon_url(logo_base: &str) -> String {
    pool_icon_url(logo_base, "default")
}

/// A pool identity pattern
#[derive(Debug)]
pub struct PoolPattern {
    pub name: &'static str,
    pub slug: &'static str,
    re: Regex,
}

impl PoolPattern {
    fn new(pattern: &str, name: &'static str, slug: &'static str) -> Self {
        // Patterns are compile-time literals
        let re = Regex::new(&format!("(?i){}", pattern)).unwrap_or_else(|e| panic!("invalid pool pattern {pattern}: {e}"));
        Self { name, slug, re }
    }

    pub fn is_match(&self, ascii: &str) -> bool {
        self.re.is_match(ascii)
    }
}

/// Pool patterns in priority order; the first match wins
pub static POOL_PATTERNS: LazyLock<Vec<PoolPattern>> = LazyLock::new(|| {
    vec![
        PoolPattern::new(r"(secpool|sec *pool)", "SECPOOL", "secpool"),
        PoolPattern::new(r"(spider ?pool|spiderpool)", "SpiderPool", "spiderpool"),
        PoolPattern::new(r"(binance( *pool)?|bnbpool)", "Binance Pool", "binancepool"),
        PoolPattern::new(r"(foundry|foundryusa)", "Foundry USA", "foundryusa"),
        PoolPattern::new(r"(antpool)", "AntPool", "antpool"),
        PoolPattern::new(r"(f2pool)", "F2Pool", "f2pool"),
        PoolPattern::new(r"(viabtc)", "ViaBTC", "viabtc"),
        PoolPattern::new(r"(btc[.]com|btccom)", "BTC.com", "btccom"),
        PoolPattern::new(r"(luxor)", "Luxor", "luxor"),
        PoolPattern::new(r"(mara|marapool)", "MARA Pool", "marapool"),
        PoolPattern::new(r"(sbicrypto|sbi.*crypto)", "SBI Crypto", "sbicrypto"),
    ]
});

/// Pool identity found by pattern attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMatch {
    pub name: &'static str,
    pub slug: &'static str,
}

impl PoolMatch {
    pub fn into_pool_info(self, logo_base: &str) -> PoolInfo {
        PoolInfo::with_derived_icon(self.name, self.slug, logo_base)
    }
}

/// Check whether a hex string contains the marker
///
/// Operates on the raw hex text, so the marker is also found outside formal
/// pushes and may straddle byte boundaries of unrelated opcodes.
pub fn contains_marker(hex_str: &str) -> bool {
    !hex_str.is_empty() && hex_str.to_ascii_lowercase().contains(MARKER_HEX)
}

/// Attribute a coinbase input script to a mining pool
///
/// # Returns
/// `Some(PoolMatch)` for the first pattern matching the script's visible
/// ASCII, `None` otherwise
pub fn attribute_pool(coinbase_script_hex: &str) -> Option<PoolMatch> {
    let ascii = bytes_to_visible_ascii(coinbase_script_hex);
    attribute_pool_ascii(&ascii)
}

/// Attribute already-rendered ASCII to a mining pool
pub fn attribute_pool_ascii(ascii: &str) -> Option<PoolMatch> {
    POOL_PATTERNS
        .iter()
        .find(|p| p.is_match(ascii))
        .map(|p| PoolMatch { name: p.name, slug: p.slug })
}
