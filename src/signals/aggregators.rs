//! Per-market signal reducers. Every function here is pure: the same events
//! and parameters always give the same score.

use std::collections::HashSet;

use crate::config::SignalConfig;
use crate::core::{LookbackWindow, SwapEvent, TransferEvent};
use crate::error::AggregationError;
use crate::tags::{normalize_address, AddressBook};

/// Tunables shared by the aggregators.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalParams {
    pub baseline_volume: f64,
    pub baseline_liquidity_ratio: f64,
    pub busy_trade_count: u64,
    pub whale_threshold: f64,
    pub whale_seller_count: u64,
    pub reference_liquidity: f64,
}

impl From<&SignalConfig> for SignalParams {
    fn from(c: &SignalConfig) -> Self {
        Self {
            baseline_volume: c.baseline_volume,
            baseline_liquidity_ratio: c.baseline_liquidity_ratio,
            busy_trade_count: c.busy_trade_count,
            whale_threshold: c.whale_threshold,
            whale_seller_count: c.whale_seller_count,
            reference_liquidity: c.reference_liquidity,
        }
    }
}

impl SignalParams {
    /// Pool reserves when known, the configured stand-in otherwise.
    pub fn reference_liquidity(&self, pool_liquidity: Option<f64>) -> f64 {
        pool_liquidity
            .filter(|l| *l > 0.0)
            .unwrap_or(self.reference_liquidity)
    }

    /// Normal volume for a market: explicit override, then a share of pool
    /// reserves, then the global default.
    pub fn baseline_volume(&self, market_override: Option<f64>, pool_liquidity: Option<f64>) -> f64 {
        if let Some(v) = market_override {
            return v;
        }
        match pool_liquidity {
            Some(l) if l > 0.0 && self.baseline_liquidity_ratio > 0.0 => l * self.baseline_liquidity_ratio,
            _ => self.baseline_volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DexActivity {
    pub score: f64,
    pub swap_count: u64,
    pub volume: f64,
    pub baseline: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WhalePressure {
    pub score: f64,
    pub sell_total: f64,
    pub sellers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetFlow {
    pub score: f64,
    pub inflow: f64,
    pub outflow: f64,
}

impl NetFlow {
    pub fn net(&self) -> f64 {
        self.inflow - self.outflow
    }
}

/// Reject swaps that belong to another market or move nothing.
pub fn check_swaps(market_id: &str, swaps: &[SwapEvent]) -> Result<(), AggregationError> {
    for swap in swaps {
        if swap.market_id != market_id {
            return Err(AggregationError::ForeignEvent {
                expected: market_id.to_string(),
                found: swap.market_id.clone(),
            });
        }
        if swap.amount_in == 0 && swap.amount_out == 0 {
            return Err(AggregationError::EmptySwap {
                block: swap.block_number,
                log_index: swap.log_index,
            });
        }
    }
    Ok(())
}

pub fn check_transfers(transfers: &[TransferEvent]) -> Result<(), AggregationError> {
    match transfers.iter().find(|t| t.amount == 0) {
        Some(t) => Err(AggregationError::EmptyTransfer {
            block: t.block_number,
            log_index: t.log_index,
        }),
        None => Ok(()),
    }
}

/// Swap volume and count against the baseline.
/// volume/baseline ≥ 1, 2, 5 → 25, 50, 75; +25 when the pool is busy.
pub fn dex_activity(
    market_id: &str,
    swaps: &[SwapEvent],
    window: &LookbackWindow,
    baseline: f64,
    params: &SignalParams,
) -> Result<DexActivity, AggregationError> {
    check_swaps(market_id, swaps)?;

    let in_window = swaps.iter().filter(|s| window.contains(s.block_number));
    let (swap_count, volume) = in_window.fold((0u64, 0.0f64), |(n, v), s| (n + 1, v + s.base_amount()));

    if baseline <= 0.0 || !baseline.is_finite() {
        return Ok(DexActivity { score: 0.0, swap_count, volume, baseline });
    }

    let ratio = volume / baseline;
    let mut score: f64 = if ratio >= 5.0 {
        75.0
    } else if ratio >= 2.0 {
        50.0
    } else if ratio >= 1.0 {
        25.0
    } else {
        0.0
    };
    if swap_count > params.busy_trade_count {
        score += 25.0;
    }

    Ok(DexActivity {
        score: score.clamp(0.0, 100.0),
        swap_count,
        volume,
        baseline,
    })
}

/// Base-asset sells by whales. Buys never add pressure. Sellers are keyed by
/// the swap recipient, since the logged sender is usually a router.
/// Any whale sell → 15; sell total / reference ≥ 0.1%, 1%, 3% → 30, 60, 85;
/// +15 when enough distinct whales are selling.
pub fn whale_pressure(
    market_id: &str,
    swaps: &[SwapEvent],
    window: &LookbackWindow,
    reference_liquidity: f64,
    book: &AddressBook,
    params: &SignalParams,
) -> Result<WhalePressure, AggregationError> {
    check_swaps(market_id, swaps)?;

    let mut sell_total = 0.0;
    let mut sellers: HashSet<String> = HashSet::new();
    for swap in swaps.iter().filter(|s| window.contains(s.block_number)) {
        if !swap.token_in_is_base {
            continue;
        }
        let size = swap.base_amount();
        let known = book.is_whale(&swap.sender) || book.is_whale(&swap.recipient);
        if size > params.whale_threshold || known {
            sell_total += size;
            sellers.insert(normalize_address(&swap.recipient));
        }
    }

    if sellers.is_empty() {
        return Ok(WhalePressure::default());
    }

    let share = if reference_liquidity > 0.0 {
        sell_total / reference_liquidity
    } else {
        0.0
    };
    let mut score: f64 = if share >= 0.03 {
        85.0
    } else if share >= 0.01 {
        60.0
    } else if share >= 0.001 {
        30.0
    } else {
        15.0
    };
    if sellers.len() as u64 >= params.whale_seller_count {
        score += 15.0;
    }

    Ok(WhalePressure {
        score: score.clamp(0.0, 100.0),
        sell_total,
        sellers: sellers.len() as u64,
    })
}

/// Net base-token flow into exchange addresses.
/// Outflow ≥ inflow → 0; net / reference > 0, ≥ 0.5%, ≥ 2% → 33, 66, 100.
pub fn cex_net_flow(
    transfers: &[TransferEvent],
    window: &LookbackWindow,
    reference_liquidity: f64,
    book: &AddressBook,
) -> Result<NetFlow, AggregationError> {
    check_transfers(transfers)?;

    let mut inflow = 0.0;
    let mut outflow = 0.0;
    for t in transfers.iter().filter(|t| window.contains(t.block_number)) {
        let to_exchange = book.is_exchange(&t.to);
        let from_exchange = book.is_exchange(&t.from);
        match (from_exchange, to_exchange) {
            (false, true) => inflow += t.amount as f64,
            (true, false) => outflow += t.amount as f64,
            // exchange-internal shuffles and unrelated transfers
            _ => {}
        }
    }

    let net = inflow - outflow;
    if net <= 0.0 {
        return Ok(NetFlow { score: 0.0, inflow, outflow });
    }

    let share = if reference_liquidity > 0.0 {
        net / reference_liquidity
    } else {
        0.0
    };
    let score = if share >= 0.02 {
        100.0
    } else if share >= 0.005 {
        66.0
    } else {
        33.0
    };

    Ok(NetFlow { score, inflow, outflow })
}
