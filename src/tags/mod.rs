use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Market, MarketType};

/// A tag identifying an address as belonging to a known entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressTag {
    pub address: String,
    pub entity: String,
    pub entity_type: MarketType,
}

/// `0x` followed by 40 hex digits.
pub fn is_hex_address(s: &str) -> bool {
    let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) else {
        return false;
    };
    hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercase form used for every address comparison.
pub fn normalize_address(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

/// In-memory lookup of whale and exchange addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    map: HashMap<String, AddressTag>,
}

impl AddressBook {
    /// Collect whale and exchange entries from the market list.
    pub fn from_markets(markets: &[Market]) -> Self {
        let mut book = Self::default();
        for market in markets {
            if market.market_type == MarketType::DexPool {
                continue;
            }
            book.insert(AddressTag {
                address: normalize_address(&market.address),
                entity: market.label.clone(),
                entity_type: market.market_type,
            });
        }
        tracing::info!(
            "AddressBook loaded {} whale and {} exchange addresses",
            book.count(MarketType::Whale),
            book.count(MarketType::Exchange)
        );
        book
    }

    pub fn insert(&mut self, tag: AddressTag) {
        self.map.insert(normalize_address(&tag.address), tag);
    }

    /// Add exchange addresses from a CSV with header `address,entity[,...]`.
    /// Malformed lines are skipped. Returns the number of tags added.
    pub fn load_exchange_csv(&mut self, path: &Path) -> std::io::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let mut count = 0;
        for line in content.lines().skip(1) {
            // skip header
            let parts: Vec<&str> = line.splitn(3, ',').collect();
            if parts.len() < 2 || !is_hex_address(parts[0].trim()) {
                continue;
            }
            self.insert(AddressTag {
                address: parts[0].trim().to_string(),
                entity: parts[1].trim().to_string(),
                entity_type: MarketType::Exchange,
            });
            count += 1;
        }
        Ok(count)
    }

    /// Number of loaded tags.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, address: &str) -> Option<&AddressTag> {
        self.map.get(&normalize_address(address))
    }

    pub fn is_exchange(&self, address: &str) -> bool {
        self.get(address)
            .is_some_and(|t| t.entity_type == MarketType::Exchange)
    }

    pub fn is_whale(&self, address: &str) -> bool {
        self.get(address)
            .is_some_and(|t| t.entity_type == MarketType::Whale)
    }

    /// Exchange addresses, sorted for stable RPC filters.
    pub fn exchange_addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .map
            .values()
            .filter(|t| t.entity_type == MarketType::Exchange)
            .map(|t| normalize_address(&t.address))
            .collect();
        out.sort();
        out
    }

    fn count(&self, kind: MarketType) -> usize {
        self.map.values().filter(|t| t.entity_type == kind).count()
    }
}
