//! Node configuration: dispute windows, virtual-channel safety margins and
//! the coin registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Asset;

/// Timing and policy knobs. All durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// On-chain quarantine window after an uncooperative close starts.
    pub quarantine_duration: i64,
    /// Margin to get a commit confirmed on chain.
    pub buffer_to_commit: i64,
    /// On-chain window for settling conditionals after quarantine.
    pub conditional_close_duration: i64,
    /// Minimum headroom demanded per virtual hop.
    pub min_safe_virtual_timeout: i64,
    /// Upper bound on conditionals per channel side.
    pub virtual_channels_limit: usize,
    /// Key for webhook body signatures.
    pub webhook_key: Vec<u8>,
    /// Known extra-currency coins.
    pub extra_currencies: HashMap<u32, CoinConfig>,
    /// Known token coins by master address.
    pub tokens: HashMap<String, CoinConfig>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            quarantine_duration: 3600,
            buffer_to_commit: 300,
            conditional_close_duration: 300,
            min_safe_virtual_timeout: 60,
            virtual_channels_limit: 30_000,
            webhook_key: Vec::new(),
            extra_currencies: HashMap::new(),
            tokens: HashMap::new(),
        }
    }
}

impl ChannelConfig {
    /// Latest point we can still act off-chain and be guaranteed room to
    /// settle on-chain if the peer disappears.
    pub fn safe_deadline(&self, uncooperative_deadline: i64) -> i64 {
        uncooperative_deadline
            - self.quarantine_duration
            - self.buffer_to_commit
            - self.conditional_close_duration
            - self.min_safe_virtual_timeout
    }
}

/// Display parameters of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinConfig {
    pub decimals: u32,
    pub symbol: String,
}

impl CoinConfig {
    pub fn native() -> Self {
        Self {
            decimals: 9,
            symbol: "TON".into(),
        }
    }
}

impl ChannelConfig {
    /// Look up the coin configuration for an asset.
    pub fn coin_config(&self, asset: &Asset) -> Option<CoinConfig> {
        match asset {
            Asset::Native => Some(CoinConfig::native()),
            Asset::ExtraCurrency(id) => self.extra_currencies.get(id).cloned(),
            Asset::Token(master) => self.tokens.get(master).cloned(),
        }
    }
}
