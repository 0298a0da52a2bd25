//! Read-only HTTP query API over the store.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::config::ApiConfig;
use crate::core::{AlertRecord, Market, RiskLevel, SignalSnapshot, SwapEvent};
use crate::db::{Database, SharedDatabase};
use crate::error::{ApiError, StoreError};

const DEFAULT_HISTORY_HOURS: u32 = 24;
const MAX_HISTORY_HOURS: u32 = 168;
const DEFAULT_TX_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;
const DEFAULT_ALERT_LIMIT: usize = 50;

/// What every handler gets: the store and the configured markets.
#[derive(Clone)]
pub struct ApiState {
    db: SharedDatabase,
    markets: Arc<Vec<Market>>,
}

impl ApiState {
    pub fn new(db: SharedDatabase, markets: Vec<Market>) -> Self {
        Self {
            db,
            markets: Arc::new(markets),
        }
    }

    fn find(&self, id: &str) -> Option<&Market> {
        self.markets.iter().find(|m| m.id == id || m.label == id)
    }

    fn label_of(&self, market_id: &str) -> String {
        self.find(market_id)
            .map(|m| m.label.clone())
            .unwrap_or_else(|| market_id.to_string())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarketView {
    id: String,
    label: String,
    #[serde(rename = "type")]
    market_type: String,
    address: String,
    description: Option<String>,
    token0: String,
    token1: String,
    risk_level: Option<u8>,
    risk_score: Option<f64>,
    last_updated: Option<DateTime<Utc>>,
    is_active: bool,
}

impl MarketView {
    fn new(market: &Market, latest: Option<&SignalSnapshot>) -> Self {
        let (token0, token1) = market.token_pair();
        Self {
            id: market.id.clone(),
            label: market.label.clone(),
            market_type: market.market_type.as_str().to_string(),
            address: market.address.clone(),
            description: market.description.clone(),
            token0,
            token1,
            risk_level: latest.map(|s| s.risk_level.as_u8()),
            risk_score: latest.map(|s| s.total_score),
            last_updated: latest.map(|s| s.timestamp),
            is_active: market.is_monitored(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HistoryPoint {
    timestamp: DateTime<Utc>,
    level: u8,
    score: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FactorsView {
    dex: DexFactors,
    whale: WhaleFactors,
    cex: CexFactors,
    from_block: u64,
    to_block: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DexFactors {
    score: f64,
    tx_count: u64,
    volume: f64,
    baseline: f64,
    volume_ratio: f64,
    liquidity: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WhaleFactors {
    score: f64,
    sell_volume: f64,
    active_count: u64,
    sell_ratio: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CexFactors {
    score: f64,
    total_inflow: f64,
    total_outflow: f64,
    net_inflow: f64,
    net_inflow_ratio: f64,
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

impl From<&SignalSnapshot> for FactorsView {
    fn from(s: &SignalSnapshot) -> Self {
        let f = &s.factors;
        let net = f.cex_inflow - f.cex_outflow;
        Self {
            dex: DexFactors {
                score: s.dex_activity_score,
                tx_count: f.swap_count,
                volume: f.swap_volume,
                baseline: f.baseline_volume,
                volume_ratio: ratio(f.swap_volume, f.baseline_volume),
                liquidity: f.pool_liquidity,
            },
            whale: WhaleFactors {
                score: s.whale_pressure_score,
                sell_volume: f.whale_sell_total,
                active_count: f.whale_sellers,
                sell_ratio: ratio(f.whale_sell_total, f.reference_liquidity),
            },
            cex: CexFactors {
                score: s.cex_net_flow_score,
                total_inflow: f.cex_inflow,
                total_outflow: f.cex_outflow,
                net_inflow: net,
                net_inflow_ratio: ratio(net, f.reference_liquidity),
            },
            from_block: f.from_block,
            to_block: f.to_block,
            updated_at: s.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionView {
    tx_hash: String,
    block_number: u64,
    log_index: u64,
    timestamp: i64,
    token_in: String,
    token_out: String,
    /// u128 amounts overflow JSON numbers, so they go out as strings.
    amount_in: String,
    amount_out: String,
    trader: String,
    recipient: String,
}

impl TransactionView {
    fn new(market: &Market, swap: &SwapEvent) -> Self {
        let (token0, token1) = market.token_pair();
        let (base, quote) = if market.base_token_index == 0 {
            (token0, token1)
        } else {
            (token1, token0)
        };
        let (token_in, token_out) = if swap.token_in_is_base {
            (base, quote)
        } else {
            (quote, base)
        };
        Self {
            tx_hash: swap.tx_hash.clone(),
            block_number: swap.block_number,
            log_index: swap.log_index,
            timestamp: swap.timestamp.timestamp(),
            token_in,
            token_out,
            amount_in: swap.amount_in.to_string(),
            amount_out: swap.amount_out.to_string(),
            trader: swap.sender.clone(),
            recipient: swap.recipient.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertView {
    id: Option<i64>,
    market_id: String,
    market_label: String,
    #[serde(rename = "type")]
    kind: &'static str,
    severity: &'static str,
    previous_level: u8,
    new_level: u8,
    message: String,
    created_at: DateTime<Utc>,
}

impl AlertView {
    fn new(alert: AlertRecord, market_label: String) -> Self {
        Self {
            id: alert.id,
            market_id: alert.market_id,
            market_label,
            kind: "risk_level_change",
            severity: alert.severity.as_str(),
            previous_level: alert.previous_level.as_u8(),
            new_level: alert.new_level.as_u8(),
            message: alert.message,
            created_at: alert.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OverviewStats {
    total_markets: usize,
    high_risk_markets: usize,
    today_transactions: usize,
    unresolved_alerts: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    severity: Option<String>,
    limit: Option<usize>,
}

fn json_reply<T: Serialize>(body: &T) -> Response {
    warp::reply::json(body).into_response()
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: message.into(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn store_failure(e: StoreError) -> Response {
    error!("Store read failed: {e}");
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
}

fn not_found() -> Response {
    error_reply(StatusCode::NOT_FOUND, "Market not found")
}

/// `limit` within 1..=MAX_LIMIT, or the default when absent.
fn check_limit(limit: Option<usize>, default: usize) -> Result<usize, Response> {
    match limit {
        None => Ok(default),
        Some(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        Some(n) => Err(error_reply(
            StatusCode::BAD_REQUEST,
            format!("limit {n} must be between 1 and {MAX_LIMIT}"),
        )),
    }
}

async fn health() -> Result<Response, Infallible> {
    Ok(json_reply(&serde_json::json!({
        "status": "ok",
        "message": "chainmonitor API is running",
    })))
}

async fn list_markets(state: ApiState) -> Result<Response, Infallible> {
    let latest: HashMap<String, SignalSnapshot> = match state.db.blocking(|db| db.latest_all()).await {
        Ok(all) => all.into_iter().map(|s| (s.market_id.clone(), s)).collect(),
        Err(e) => return Ok(store_failure(e)),
    };
    let markets: Vec<MarketView> = state
        .markets
        .iter()
        .filter(|m| m.is_monitored())
        .map(|m| MarketView::new(m, latest.get(&m.id)))
        .collect();
    Ok(json_reply(&serde_json::json!({ "markets": markets })))
}

async fn market_detail(id: String, state: ApiState) -> Result<Response, Infallible> {
    let Some(market) = state.find(&id) else {
        return Ok(not_found());
    };
    let market_id = market.id.clone();
    match state.db.blocking(move |db| db.latest(&market_id)).await {
        Ok(latest) => Ok(json_reply(&MarketView::new(market, latest.as_ref()))),
        Err(e) => Ok(store_failure(e)),
    }
}

async fn risk_history(id: String, query: HistoryQuery, state: ApiState) -> Result<Response, Infallible> {
    let Some(market) = state.find(&id) else {
        return Ok(not_found());
    };
    let hours = query.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
    if !(1..=MAX_HISTORY_HOURS).contains(&hours) {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            format!("hours {hours} must be between 1 and {MAX_HISTORY_HOURS}"),
        ));
    }
    let since = Utc::now() - Duration::hours(i64::from(hours));
    let market_id = market.id.clone();
    match state.db.blocking(move |db| db.history(&market_id, Some(since))).await {
        Ok(snapshots) => {
            let history: Vec<HistoryPoint> = snapshots
                .iter()
                .map(|s| HistoryPoint {
                    timestamp: s.timestamp,
                    level: s.risk_level.as_u8(),
                    score: s.total_score,
                })
                .collect();
            Ok(json_reply(&serde_json::json!({ "history": history })))
        }
        Err(e) => Ok(store_failure(e)),
    }
}

async fn risk_factors(id: String, state: ApiState) -> Result<Response, Infallible> {
    let Some(market) = state.find(&id) else {
        return Ok(not_found());
    };
    let market_id = market.id.clone();
    match state.db.blocking(move |db| db.latest(&market_id)).await {
        Ok(latest) => {
            let factors = latest.as_ref().map(FactorsView::from);
            Ok(json_reply(&serde_json::json!({ "factors": factors })))
        }
        Err(e) => Ok(store_failure(e)),
    }
}

async fn transactions(id: String, query: LimitQuery, state: ApiState) -> Result<Response, Infallible> {
    let Some(market) = state.find(&id) else {
        return Ok(not_found());
    };
    let limit = match check_limit(query.limit, DEFAULT_TX_LIMIT) {
        Ok(n) => n,
        Err(reply) => return Ok(reply),
    };
    let market_id = market.id.clone();
    match state.db.blocking(move |db| db.recent_swaps(&market_id, limit)).await {
        Ok(swaps) => {
            let txs: Vec<TransactionView> = swaps.iter().map(|s| TransactionView::new(market, s)).collect();
            Ok(json_reply(&serde_json::json!({ "transactions": txs })))
        }
        Err(e) => Ok(store_failure(e)),
    }
}

async fn alerts(query: AlertQuery, state: ApiState) -> Result<Response, Infallible> {
    let severity = match query.severity.as_deref() {
        None => None,
        Some(s) => match RiskLevel::parse(s) {
            Some(level) => Some(level),
            None => {
                return Ok(error_reply(
                    StatusCode::BAD_REQUEST,
                    format!("unknown severity {s:?}, expected low|medium|high|critical"),
                ))
            }
        },
    };
    let limit = match check_limit(query.limit, DEFAULT_ALERT_LIMIT) {
        Ok(n) => n,
        Err(reply) => return Ok(reply),
    };
    match state.db.blocking(move |db| db.alerts(severity, limit)).await {
        Ok(records) => {
            let alerts: Vec<AlertView> = records
                .into_iter()
                .map(|a| {
                    let label = state.label_of(&a.market_id);
                    AlertView::new(a, label)
                })
                .collect();
            Ok(json_reply(&serde_json::json!({ "alerts": alerts })))
        }
        Err(e) => Ok(store_failure(e)),
    }
}

fn overview_stats(db: &Database, total_markets: usize, now: DateTime<Utc>) -> Result<OverviewStats, StoreError> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(now - Duration::hours(24));
    let latest = db.latest_all()?;
    Ok(OverviewStats {
        total_markets,
        high_risk_markets: latest.iter().filter(|s| s.risk_level >= RiskLevel::High).count(),
        today_transactions: db.count_swaps_since(midnight)?,
        unresolved_alerts: db.count_alerts_since(now - Duration::hours(24), RiskLevel::High)?,
    })
}

async fn overview(state: ApiState) -> Result<Response, Infallible> {
    let total_markets = state.markets.iter().filter(|m| m.is_monitored()).count();
    match state
        .db
        .blocking(move |db| overview_stats(db, total_markets, Utc::now()))
        .await
    {
        Ok(stats) => Ok(json_reply(&stats)),
        Err(e) => Ok(store_failure(e)),
    }
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if err.is_not_found() {
        Ok(error_reply(StatusCode::NOT_FOUND, "Not found"))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        Ok(error_reply(StatusCode::BAD_REQUEST, e.to_string()))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        Ok(error_reply(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"))
    } else {
        warn!("Unhandled rejection: {err:?}");
        Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
    }
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Origins warp's CORS builder will accept. Anything else would panic there.
fn valid_origins(origins: &[String]) -> Vec<&str> {
    origins
        .iter()
        .map(String::as_str)
        .filter(|o| {
            let rest = o.strip_prefix("http://").or_else(|| o.strip_prefix("https://"));
            let ok = matches!(rest, Some(host) if !host.is_empty() && !host.contains('/'));
            if !ok {
                warn!("Ignoring invalid CORS origin {o:?}");
            }
            ok
        })
        .collect()
}

/// All API routes, with CORS and JSON rejections.
pub fn routes(
    state: ApiState,
    allowed_origins: Vec<String>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health_route = warp::path::end()
        .or(warp::path!("health"))
        .unify()
        .and(warp::get())
        .and_then(health);

    let markets = warp::path!("api" / "markets")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_markets);

    let detail = warp::path!("api" / "markets" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(market_detail);

    let history = warp::path!("api" / "markets" / String / "risk-history")
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(with_state(state.clone()))
        .and_then(risk_history);

    let factors = warp::path!("api" / "markets" / String / "factors")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(risk_factors);

    let txs = warp::path!("api" / "markets" / String / "transactions")
        .and(warp::get())
        .and(warp::query::<LimitQuery>())
        .and(with_state(state.clone()))
        .and_then(transactions);

    let alert_list = warp::path!("api" / "alerts")
        .and(warp::get())
        .and(warp::query::<AlertQuery>())
        .and(with_state(state.clone()))
        .and_then(alerts);

    let stats = warp::path!("api" / "stats" / "overview")
        .and(warp::get())
        .and(with_state(state))
        .and_then(overview);

    let cors = warp::cors()
        .allow_origins(valid_origins(&allowed_origins))
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    health_route
        .or(markets)
        .or(detail)
        .or(history)
        .or(factors)
        .or(txs)
        .or(alert_list)
        .or(stats)
        .recover(handle_rejection)
        .with(cors)
}

/// Bind and serve on a separate Tokio task until `shutdown` flips to true.
pub fn start_api_server(
    state: ApiState,
    config: &ApiConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>), ApiError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let signal = async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
    };
    let (bound, server) =
        warp::serve(routes(state, config.allowed_origins.clone())).try_bind_with_graceful_shutdown(addr, signal)?;
    info!("Query API listening on http://{bound}");
    Ok((bound, tokio::spawn(server)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FactorInputs, MarketType};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn open_test_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "chainmonitor_api_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    fn market(label: &str, market_type: MarketType) -> Market {
        Market {
            id: label.into(),
            label: label.into(),
            market_type,
            address: "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc".into(),
            description: None,
            base_token: None,
            base_token_index: 0,
            baseline_volume: None,
        }
    }

    fn snapshot(market_id: &str, minutes_ago: i64, total: f64) -> SignalSnapshot {
        SignalSnapshot {
            market_id: market_id.into(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            dex_activity_score: 50.0,
            whale_pressure_score: 0.0,
            cex_net_flow_score: 0.0,
            total_score: total,
            risk_level: RiskLevel::from_score(total),
            factors: FactorInputs {
                swap_count: 3,
                swap_volume: 2e21,
                baseline_volume: 1e21,
                reference_liquidity: 1e24,
                ..FactorInputs::default()
            },
        }
    }

    fn setup() -> (SharedDatabase, ApiState) {
        let db = open_test_db();
        let markets = vec![
            market("UNISWAP_USDC_WETH", MarketType::DexPool),
            market("UNISWAP_DAI_WETH", MarketType::DexPool),
            market("BINANCE_HOT", MarketType::Exchange),
        ];
        let state = ApiState::new(db.clone(), markets);
        (db, state)
    }

    async fn get(state: &ApiState, path: &str) -> (StatusCode, serde_json::Value) {
        let filter = routes(state.clone(), ApiConfig::default().allowed_origins);
        let res = warp::test::request().method("GET").path(path).reply(&filter).await;
        let body = serde_json::from_slice(res.body()).unwrap_or(serde_json::Value::Null);
        (res.status(), body)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (_db, state) = setup();
        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn lists_only_pools_with_null_fields_before_data() {
        let (db, state) = setup();
        db.append_snapshot(&snapshot("UNISWAP_USDC_WETH", 5, 45.0)).unwrap();

        let (status, body) = get(&state, "/api/markets").await;
        assert_eq!(status, StatusCode::OK);
        let markets = body["markets"].as_array().unwrap();
        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0]["riskLevel"], 2);
        assert_eq!(markets[0]["token0"], "USDC");
        assert_eq!(markets[0]["type"], "dex_pool");
        assert!(markets[1]["riskLevel"].is_null());
        assert!(markets[1]["lastUpdated"].is_null());
    }

    #[tokio::test]
    async fn unknown_market_is_404() {
        let (_db, state) = setup();
        for path in [
            "/api/markets/NOPE",
            "/api/markets/NOPE/risk-history",
            "/api/markets/NOPE/factors",
            "/api/markets/NOPE/transactions",
        ] {
            let (status, body) = get(&state, path).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
            assert_eq!(body["error"], "Market not found");
        }
    }

    #[tokio::test]
    async fn history_window_and_bounds() {
        let (db, state) = setup();
        db.append_snapshot(&snapshot("UNISWAP_USDC_WETH", 60 * 30, 10.0)).unwrap();
        db.append_snapshot(&snapshot("UNISWAP_USDC_WETH", 30, 25.0)).unwrap();
        db.append_snapshot(&snapshot("UNISWAP_USDC_WETH", 10, 75.0)).unwrap();

        let (status, body) = get(&state, "/api/markets/UNISWAP_USDC_WETH/risk-history").await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["level"], 1);
        assert_eq!(history[1]["level"], 3);

        let (_, body) = get(&state, "/api/markets/UNISWAP_USDC_WETH/risk-history?hours=48").await;
        assert_eq!(body["history"].as_array().unwrap().len(), 3);

        let (status, _) = get(&state, "/api/markets/UNISWAP_USDC_WETH/risk-history?hours=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&state, "/api/markets/UNISWAP_USDC_WETH/risk-history?hours=169").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn factors_null_until_first_snapshot() {
        let (db, state) = setup();
        let (_, body) = get(&state, "/api/markets/UNISWAP_USDC_WETH/factors").await;
        assert!(body["factors"].is_null());

        db.append_snapshot(&snapshot("UNISWAP_USDC_WETH", 1, 20.0)).unwrap();
        let (_, body) = get(&state, "/api/markets/UNISWAP_USDC_WETH/factors").await;
        assert_eq!(body["factors"]["dex"]["txCount"], 3);
        assert_eq!(body["factors"]["dex"]["volumeRatio"], 2.0);
        assert_eq!(body["factors"]["cex"]["netInflow"], 0.0);
    }

    #[tokio::test]
    async fn transactions_newest_first_with_string_amounts() {
        let (db, state) = setup();
        let swaps: Vec<SwapEvent> = (0..3u64)
            .map(|i| SwapEvent {
                market_id: "UNISWAP_USDC_WETH".into(),
                block_number: 100 + i,
                log_index: 0,
                tx_hash: format!("0x{i:02x}"),
                timestamp: Utc::now() - Duration::minutes(10 - i as i64),
                sender: "0x1111111111111111111111111111111111111111".into(),
                recipient: "0x2222222222222222222222222222222222222222".into(),
                amount_in: u128::MAX,
                amount_out: 7,
                token_in_is_base: i % 2 == 0,
            })
            .collect();
        db.append_swaps(&swaps).unwrap();

        let (status, body) = get(&state, "/api/markets/UNISWAP_USDC_WETH/transactions?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let txs = body["transactions"].as_array().unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0]["blockNumber"], 102);
        assert_eq!(txs[0]["tokenIn"], "USDC");
        assert_eq!(txs[1]["tokenIn"], "WETH");
        assert_eq!(txs[0]["amountIn"], u128::MAX.to_string());

        let (status, _) = get(&state, "/api/markets/UNISWAP_USDC_WETH/transactions?limit=1001").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn alerts_filter_by_severity() {
        let (db, state) = setup();
        let first = snapshot("UNISWAP_USDC_WETH", 20, 10.0);
        let second = snapshot("UNISWAP_USDC_WETH", 10, 80.0);
        let third = snapshot("UNISWAP_USDC_WETH", 5, 30.0);
        db.append_cycle(&first, None).unwrap();
        let up = AlertRecord::for_transition(Some(first.risk_level), &second).unwrap();
        db.append_cycle(&second, Some(&up)).unwrap();
        let down = AlertRecord::for_transition(Some(second.risk_level), &third).unwrap();
        db.append_cycle(&third, Some(&down)).unwrap();

        let (_, body) = get(&state, "/api/alerts").await;
        let all = body["alerts"].as_array().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["severity"], "medium");
        assert_eq!(all[0]["marketLabel"], "UNISWAP_USDC_WETH");

        let (_, body) = get(&state, "/api/alerts?severity=critical").await;
        let critical = body["alerts"].as_array().unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0]["newLevel"], 3);
        assert_eq!(critical[0]["previousLevel"], 0);

        let (status, _) = get(&state, "/api/alerts?severity=extreme").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn overview_counts() {
        let (db, state) = setup();
        let calm = snapshot("UNISWAP_DAI_WETH", 10, 5.0);
        let before = snapshot("UNISWAP_USDC_WETH", 10, 5.0);
        let hot = snapshot("UNISWAP_USDC_WETH", 1, 72.0);
        db.append_cycle(&calm, None).unwrap();
        db.append_cycle(&before, None).unwrap();
        let alert = AlertRecord::for_transition(Some(before.risk_level), &hot).unwrap();
        db.append_cycle(&hot, Some(&alert)).unwrap();

        let (status, body) = get(&state, "/api/stats/overview").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalMarkets"], 2);
        assert_eq!(body["highRiskMarkets"], 1);
        assert_eq!(body["unresolvedAlerts"], 1);
        assert_eq!(body["todayTransactions"], 0);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (_db, state) = setup();
        let (status, body) = get(&state, "/api/nothing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
    }

    #[test]
    fn drops_unusable_origins() {
        let origins = vec![
            "http://localhost:3000".to_string(),
            "localhost:5173".to_string(),
            "https://app.example.com/path".to_string(),
        ];
        assert_eq!(valid_origins(&origins), vec!["http://localhost:3000"]);
    }
}
