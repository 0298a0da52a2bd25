pub mod aggregators;
pub mod score;

use chrono::{DateTime, Utc};

use crate::core::{FactorInputs, LookbackWindow, Market, MarketEvents, SignalSnapshot, Signals};
use crate::error::AggregationError;
use crate::tags::AddressBook;
use aggregators::SignalParams;
use score::ScoreWeights;

/// The signal engine runs all three aggregators and scores the result.
#[derive(Debug, Clone)]
pub struct SignalEngine {
    weights: ScoreWeights,
    params: SignalParams,
}

impl SignalEngine {
    pub fn new(weights: ScoreWeights, params: SignalParams) -> Self {
        Self { weights, params }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Reduce one market's events to signals.
    pub fn aggregate(
        &self,
        market: &Market,
        events: &MarketEvents,
        window: &LookbackWindow,
        book: &AddressBook,
    ) -> Result<(Signals, FactorInputs), AggregationError> {
        let reference = self.params.reference_liquidity(events.pool_liquidity);
        let baseline = self
            .params
            .baseline_volume(market.baseline_volume, events.pool_liquidity);

        let dex = aggregators::dex_activity(&market.id, &events.swaps, window, baseline, &self.params)?;
        let whale = aggregators::whale_pressure(&market.id, &events.swaps, window, reference, book, &self.params)?;
        let flow = aggregators::cex_net_flow(&events.transfers, window, reference, book)?;

        let signals = Signals {
            dex_activity: dex.score,
            whale_pressure: whale.score,
            cex_net_flow: flow.score,
        };
        let factors = FactorInputs {
            swap_count: dex.swap_count,
            swap_volume: dex.volume,
            baseline_volume: dex.baseline,
            pool_liquidity: events.pool_liquidity,
            reference_liquidity: reference,
            whale_sell_total: whale.sell_total,
            whale_sellers: whale.sellers,
            cex_inflow: flow.inflow,
            cex_outflow: flow.outflow,
            from_block: window.from_block,
            to_block: window.to_block,
        };
        Ok((signals, factors))
    }

    /// Score aggregated signals into a snapshot stamped with `timestamp`.
    pub fn snapshot(
        &self,
        market_id: &str,
        signals: Signals,
        factors: FactorInputs,
        timestamp: DateTime<Utc>,
    ) -> SignalSnapshot {
        let (total_score, risk_level) = score::score(&self.weights, &signals);
        SignalSnapshot {
            market_id: market_id.to_string(),
            timestamp,
            dex_activity_score: signals.dex_activity,
            whale_pressure_score: signals.whale_pressure,
            cex_net_flow_score: signals.cex_net_flow,
            total_score,
            risk_level,
            factors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::core::{MarketType, RiskLevel, SwapEvent};

    fn engine() -> SignalEngine {
        let config = SignalConfig::default();
        SignalEngine::new(
            ScoreWeights::new(0.40, 0.35, 0.30, 0.05).unwrap(),
            SignalParams::from(&config),
        )
    }

    fn pool() -> Market {
        Market {
            id: "pool".into(),
            label: "UNISWAP_USDC_WETH".into(),
            market_type: MarketType::DexPool,
            address: "0xB4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc".into(),
            description: None,
            base_token: None,
            base_token_index: 0,
            baseline_volume: None,
        }
    }

    #[test]
    fn no_events_scores_zero() {
        let e = engine();
        let window = LookbackWindow::ending_at(1000, 100);
        let (signals, factors) = e
            .aggregate(&pool(), &MarketEvents::default(), &window, &AddressBook::default())
            .unwrap();
        assert_eq!(signals.dex_activity, 0.0);
        let snap = e.snapshot("pool", signals, factors, Utc::now());
        assert_eq!(snap.total_score, 0.35 * snap.whale_pressure_score + 0.30 * snap.cex_net_flow_score);
        assert_eq!(snap.risk_level, RiskLevel::Low);
    }

    #[test]
    fn lone_whale_sell_is_capped_by_its_weight() {
        let e = engine();
        let window = LookbackWindow::ending_at(1000, 100);
        let events = MarketEvents {
            swaps: vec![SwapEvent {
                market_id: "pool".into(),
                block_number: 950,
                log_index: 3,
                tx_hash: "0x01".into(),
                timestamp: Utc::now(),
                sender: "0x1111111111111111111111111111111111111111".into(),
                recipient: "0x1111111111111111111111111111111111111111".into(),
                amount_in: 5 * 10u128.pow(20),
                amount_out: 1,
                token_in_is_base: true,
            }],
            transfers: vec![],
            pool_liquidity: None,
        };
        let (signals, factors) = e.aggregate(&pool(), &events, &window, &AddressBook::default()).unwrap();
        assert!(signals.whale_pressure > 0.0);
        assert_eq!(signals.cex_net_flow, 0.0);
        let snap = e.snapshot("pool", signals, factors, Utc::now());
        assert!(snap.total_score > 0.0);
        assert!(snap.total_score <= 35.0 + 0.40 * snap.dex_activity_score);
        assert_eq!(snap.factors.whale_sellers, 1);
    }
}
