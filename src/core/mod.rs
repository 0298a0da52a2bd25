pub mod monitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a configured address represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    DexPool,
    Whale,
    Exchange,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::DexPool => "dex_pool",
            MarketType::Whale => "whale",
            MarketType::Exchange => "exchange",
        }
    }
}

/// One entry of `markets.json`. Only `dex_pool` entries are scored; whale and
/// exchange entries label addresses for the aggregators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    #[serde(default)]
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub market_type: MarketType,
    #[serde(alias = "pairAddress")]
    pub address: String,
    #[serde(default)]
    pub description: Option<String>,
    /// ERC-20 of the pool's base asset, used for exchange net-flow.
    #[serde(default, alias = "baseToken")]
    pub base_token: Option<String>,
    /// Which pool token (0 or 1) is the base asset.
    #[serde(default, alias = "baseTokenIndex")]
    pub base_token_index: u8,
    #[serde(default, alias = "baselineVolume")]
    pub baseline_volume: Option<f64>,
}

impl Market {
    pub fn is_monitored(&self) -> bool {
        self.market_type == MarketType::DexPool
    }

    /// Token pair guessed from labels like `UNISWAP_USDC_WETH`.
    pub fn token_pair(&self) -> (String, String) {
        let parts: Vec<&str> = self.label.split('_').collect();
        if parts.len() >= 2 {
            (
                parts[parts.len() - 2].to_string(),
                parts[parts.len() - 1].to_string(),
            )
        } else {
            ("TOKEN0".to_string(), "TOKEN1".to_string())
        }
    }
}

/// A single on-chain swap, normalized from a pool `Swap` log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapEvent {
    pub market_id: String,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub recipient: String,
    pub amount_in: u128,
    pub amount_out: u128,
    /// True when the base asset was sold into the pool.
    pub token_in_is_base: bool,
}

impl SwapEvent {
    /// Size of the swap measured in the base asset.
    pub fn base_amount(&self) -> f64 {
        if self.token_in_is_base {
            self.amount_in as f64
        } else {
            self.amount_out as f64
        }
    }
}

/// Base-token transfer touching at least one exchange address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub from: String,
    pub to: String,
    pub amount: u128,
}

/// Block range the aggregators consider, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookbackWindow {
    pub from_block: u64,
    pub to_block: u64,
}

impl LookbackWindow {
    pub fn ending_at(head: u64, lookback_blocks: u64) -> Self {
        Self {
            from_block: head.saturating_sub(lookback_blocks),
            to_block: head,
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.from_block && block <= self.to_block
    }
}

/// Everything fetched for one market in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketEvents {
    pub swaps: Vec<SwapEvent>,
    pub transfers: Vec<TransferEvent>,
    /// reserve0 + reserve1, when `getReserves()` answered.
    pub pool_liquidity: Option<f64>,
}

/// The three bounded signals, each in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Signals {
    pub dex_activity: f64,
    pub whale_pressure: f64,
    pub cex_net_flow: f64,
}

/// Raw inputs behind the signal scores, kept for the factor breakdown.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorInputs {
    pub swap_count: u64,
    pub swap_volume: f64,
    pub baseline_volume: f64,
    pub pool_liquidity: Option<f64>,
    pub reference_liquidity: f64,
    pub whale_sell_total: f64,
    pub whale_sellers: u64,
    pub cex_inflow: f64,
    pub cex_outflow: f64,
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,      // <20
    Medium,   // ≥20
    High,     // ≥40
    Critical, // ≥70
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 70.0 {
            RiskLevel::Critical
        } else if score >= 40.0 {
            RiskLevel::High
        } else if score >= 20.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }

    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(RiskLevel::Low),
            1 => Some(RiskLevel::Medium),
            2 => Some(RiskLevel::High),
            3 => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "🔴",
            RiskLevel::High => "🟠",
            RiskLevel::Medium => "🟡",
            RiskLevel::Low => "⚪",
        }
    }
}

/// One market's result for one pass. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub market_id: String,
    pub timestamp: DateTime<Utc>,
    pub dex_activity_score: f64,
    pub whale_pressure_score: f64,
    pub cex_net_flow_score: f64,
    pub total_score: f64,
    pub risk_level: RiskLevel,
    pub factors: FactorInputs,
}

/// Written when a market's level differs from its previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Option<i64>,
    pub market_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_level: RiskLevel,
    pub new_level: RiskLevel,
    pub severity: RiskLevel,
    pub message: String,
}

impl AlertRecord {
    /// Compare a fresh snapshot with the market's previous level.
    /// `None` when there is no previous snapshot or the level is unchanged.
    pub fn for_transition(previous: Option<RiskLevel>, snapshot: &SignalSnapshot) -> Option<Self> {
        let previous = previous?;
        if previous == snapshot.risk_level {
            return None;
        }
        Some(Self {
            id: None,
            market_id: snapshot.market_id.clone(),
            timestamp: snapshot.timestamp,
            previous_level: previous,
            new_level: snapshot.risk_level,
            severity: snapshot.risk_level,
            message: format!(
                "Risk level changed from {} to {} (score {:.1})",
                previous.as_u8(),
                snapshot.risk_level.as_u8(),
                snapshot.total_score
            ),
        })
    }
}
