pub mod decode;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ChainConfig;
use crate::core::{Market, MarketEvents, MarketType, TransferEvent};
use crate::error::FetchError;
use crate::tags::is_hex_address;
use decode::{BlockClock, SWAP_TOPIC, TRANSFER_TOPIC};

/// `getReserves()` selector on Uniswap V2 pairs.
const GET_RESERVES: &str = "0x0902f1ac";

/// JSON-RPC error codes nodes use for throttling and oversized ranges.
const TRANSIENT_RPC_CODES: &[i64] = &[-32005, -32016, 429];

/// Read-only view of the chain the monitor pulls from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Latest block number.
    async fn head_block(&self) -> Result<u64, FetchError>;

    /// Swaps, base-token exchange transfers and pool reserves for one market
    /// in `[from_block, to_block]`. An empty range is not an error.
    async fn fetch_events(
        &self,
        market: &Market,
        from_block: u64,
        to_block: u64,
    ) -> Result<MarketEvents, FetchError>;
}

/// Simple Ethereum JSON-RPC client.
pub struct EthRpc {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
    max_retries: u32,
    retry_backoff: Duration,
}

impl EthRpc {
    pub fn new(config: &ChainConfig) -> Result<Self, FetchError> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let auth = match (&config.rpc_user, &config.rpc_password) {
            (Some(user), Some(pass)) => Some(STANDARD.encode(format!("{user}:{pass}"))),
            _ => None,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| FetchError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            url: config.rpc_url.clone(),
            client,
            auth,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, FetchError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(auth) = &self.auth {
            request = request.header("Authorization", format!("Basic {auth}"));
        }

        let resp = request.send().await.map_err(classify_http)?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::Transient(format!("{method}: HTTP {status}")));
        }
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("{method}: HTTP {status}")));
        }

        let json: Value = resp.json().await.map_err(classify_http)?;

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            return Err(classify_rpc_error(method, err));
        }

        Ok(json["result"].clone())
    }

    /// `call` with exponential backoff on transient failures.
    pub async fn call_with_retry(&self, method: &str, params: Vec<Value>) -> Result<Value, FetchError> {
        let mut attempt = 0;
        loop {
            match self.call(method, params.clone()).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
                    debug!(method, attempt, ?delay, "Retrying after transient RPC failure: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn block_number(&self) -> Result<u64, FetchError> {
        let result = self.call_with_retry("eth_blockNumber", vec![]).await?;
        result
            .as_str()
            .and_then(decode::parse_hex_u64)
            .ok_or_else(|| FetchError::Transient(format!("eth_blockNumber returned {result}")))
    }

    /// Unix timestamp of a block.
    pub async fn block_timestamp(&self, block: u64) -> Result<i64, FetchError> {
        let result = self
            .call_with_retry("eth_getBlockByNumber", vec![json!(decode::to_hex(block)), json!(false)])
            .await?;
        result
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(decode::parse_hex_u64)
            .map(|t| t as i64)
            .ok_or_else(|| FetchError::Transient(format!("block {block} has no timestamp")))
    }

    pub async fn get_logs(&self, filter: Value) -> Result<Vec<Value>, FetchError> {
        let result = self.call_with_retry("eth_getLogs", vec![filter]).await?;
        match result {
            Value::Array(logs) => Ok(logs),
            Value::Null => Ok(Vec::new()),
            other => Err(FetchError::Transient(format!("eth_getLogs returned {other}"))),
        }
    }

    /// reserve0 + reserve1 of a V2 pair.
    pub async fn pool_reserves(&self, pair: &str, block: u64) -> Result<Option<f64>, FetchError> {
        let result = self
            .call_with_retry(
                "eth_call",
                vec![json!({"to": pair, "data": GET_RESERVES}), json!(decode::to_hex(block))],
            )
            .await?;
        Ok(result.as_str().and_then(decode::decode_reserves))
    }
}

fn classify_http(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Permanent(e.to_string())
    }
}

fn classify_rpc_error(method: &str, err: &Value) -> FetchError {
    let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let throttled = ["rate limit", "limit exceeded", "timeout", "timed out", "too many"]
        .iter()
        .any(|needle| message.contains(needle));
    if TRANSIENT_RPC_CODES.contains(&code) || throttled || code == -32603 {
        FetchError::Transient(format!("{method}: {err}"))
    } else {
        FetchError::Permanent(format!("{method}: {err}"))
    }
}

/// Fetches V2 pool activity through [`EthRpc`].
pub struct ChainFetcher {
    rpc: EthRpc,
    exchange_addresses: Vec<String>,
    block_time_secs: u64,
}

impl ChainFetcher {
    pub fn new(rpc: EthRpc, exchange_addresses: Vec<String>, block_time_secs: u64) -> Self {
        Self {
            rpc,
            exchange_addresses,
            block_time_secs,
        }
    }

    async fn exchange_transfers(
        &self,
        token: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, FetchError> {
        if self.exchange_addresses.is_empty() {
            return Ok(Vec::new());
        }
        let topics: Vec<String> = self
            .exchange_addresses
            .iter()
            .map(|a| decode::address_to_topic(a))
            .collect();
        let range = (decode::to_hex(from_block), decode::to_hex(to_block));

        let outgoing = self
            .rpc
            .get_logs(json!({
                "address": token,
                "fromBlock": range.0,
                "toBlock": range.1,
                "topics": [TRANSFER_TOPIC, topics],
            }))
            .await?;
        let incoming = self
            .rpc
            .get_logs(json!({
                "address": token,
                "fromBlock": range.0,
                "toBlock": range.1,
                "topics": [TRANSFER_TOPIC, Value::Null, topics],
            }))
            .await?;

        let mut transfers: Vec<TransferEvent> = outgoing
            .iter()
            .chain(incoming.iter())
            .filter_map(|log| {
                let decoded = decode::decode_transfer(log);
                if decoded.is_none() {
                    warn!(token, "Skipping malformed Transfer log");
                }
                decoded
            })
            .collect();
        transfers.sort_by_key(|t| (t.block_number, t.log_index));
        transfers.dedup_by_key(|t| (t.block_number, t.log_index));
        Ok(transfers)
    }
}

#[async_trait]
impl EventSource for ChainFetcher {
    async fn head_block(&self) -> Result<u64, FetchError> {
        self.rpc.block_number().await
    }

    async fn fetch_events(
        &self,
        market: &Market,
        from_block: u64,
        to_block: u64,
    ) -> Result<MarketEvents, FetchError> {
        if market.market_type != MarketType::DexPool {
            return Err(FetchError::Permanent(format!(
                "market {} has unsupported type {}",
                market.id,
                market.market_type.as_str()
            )));
        }
        if !is_hex_address(&market.address) {
            return Err(FetchError::Permanent(format!(
                "market {} has invalid address {}",
                market.id, market.address
            )));
        }
        if from_block > to_block {
            return Ok(MarketEvents::default());
        }

        let logs = self
            .rpc
            .get_logs(json!({
                "address": market.address,
                "fromBlock": decode::to_hex(from_block),
                "toBlock": decode::to_hex(to_block),
                "topics": [SWAP_TOPIC],
            }))
            .await?;

        // Only ask for a block header when the node leaves timestamps out.
        let clock = if logs.iter().all(|l| l.get("blockTimestamp").is_some()) {
            BlockClock::new(to_block, 0, self.block_time_secs)
        } else {
            let head_time = self.rpc.block_timestamp(to_block).await?;
            BlockClock::new(to_block, head_time, self.block_time_secs)
        };

        let mut swaps = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode::decode_swap(log, market, &clock) {
                Some(swap) => swaps.push(swap),
                None => warn!(market = %market.id, "Skipping malformed Swap log"),
            }
        }

        let transfers = match &market.base_token {
            Some(token) => self.exchange_transfers(token, from_block, to_block).await?,
            None => Vec::new(),
        };

        let pool_liquidity = match self.rpc.pool_reserves(&market.address, to_block).await {
            Ok(l) => l,
            Err(e) => {
                warn!(market = %market.id, "getReserves failed, using reference liquidity: {e}");
                None
            }
        };

        debug!(
            market = %market.id,
            swaps = swaps.len(),
            transfers = transfers.len(),
            from_block,
            to_block,
            "Fetched market events"
        );

        Ok(MarketEvents {
            swaps,
            transfers,
            pool_liquidity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use warp::Filter;

    /// Local JSON-RPC node that answers with `responses` in order, repeating
    /// the last one.
    struct StubNode {
        url: String,
        hits: Arc<AtomicUsize>,
    }

    impl StubNode {
        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    fn stub_node(responses: Vec<(u16, Value)>) -> StubNode {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let responses = Arc::new(responses);
        let route = warp::post().and(warp::body::json()).map(move |_request: Value| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses[n.min(responses.len() - 1)].clone();
            warp::reply::with_status(
                warp::reply::json(&body),
                warp::http::StatusCode::from_u16(status).unwrap(),
            )
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        StubNode {
            url: format!("http://{addr}"),
            hits,
        }
    }

    fn rpc(url: &str, max_retries: u32) -> EthRpc {
        EthRpc::new(&ChainConfig {
            rpc_url: url.into(),
            max_retries,
            retry_backoff_ms: 1,
            ..ChainConfig::default()
        })
        .unwrap()
    }

    fn ok(result: Value) -> (u16, Value) {
        (200, json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    #[tokio::test]
    async fn rate_limits_and_server_errors_are_retried() {
        let node = stub_node(vec![(429, json!({})), (503, json!({})), ok(json!("0x10"))]);
        let head = rpc(&node.url, 2).block_number().await.unwrap();
        assert_eq!(head, 16);
        assert_eq!(node.hits(), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_limit() {
        let node = stub_node(vec![(502, json!({}))]);
        let err = rpc(&node.url, 2).block_number().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(node.hits(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_permanent_and_not_retried() {
        let node = stub_node(vec![(400, json!({})), ok(json!("0x10"))]);
        let err = rpc(&node.url, 3).block_number().await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
        assert_eq!(node.hits(), 1);
    }

    #[tokio::test]
    async fn node_throttling_is_retried() {
        let node = stub_node(vec![
            (200, json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32005, "message": "limit exceeded"}})),
            ok(json!([])),
        ]);
        let logs = rpc(&node.url, 1).get_logs(json!({})).await.unwrap();
        assert!(logs.is_empty());
        assert_eq!(node.hits(), 2);
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let node = stub_node(vec![(
            200,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "invalid argument 0"}}),
        )]);
        let err = rpc(&node.url, 3).get_logs(json!({})).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
        assert_eq!(node.hits(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_is_transient() {
        let err = rpc("http://127.0.0.1:9", 0).block_number().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn throttling_is_transient() {
        let err = json!({"code": -32005, "message": "query returned more than 10000 results"});
        assert!(classify_rpc_error("eth_getLogs", &err).is_transient());
        let err = json!({"code": -32000, "message": "Rate limit reached"});
        assert!(classify_rpc_error("eth_getLogs", &err).is_transient());
    }

    #[test]
    fn invalid_params_are_permanent() {
        let err = json!({"code": -32602, "message": "invalid argument 0: hex string has length 3"});
        assert!(!classify_rpc_error("eth_getLogs", &err).is_transient());
    }

    #[test]
    fn basic_auth_only_with_both_credentials() {
        let mut config = ChainConfig {
            rpc_url: "http://localhost:8545".into(),
            ..ChainConfig::default()
        };
        config.rpc_user = Some("user".into());
        assert!(EthRpc::new(&config).unwrap().auth.is_none());
        config.rpc_password = Some("pass".into());
        assert_eq!(EthRpc::new(&config).unwrap().auth.as_deref(), Some("dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn whale_entries_are_not_fetchable() {
        let config = ChainConfig {
            rpc_url: "http://127.0.0.1:9".into(),
            ..ChainConfig::default()
        };
        let fetcher = ChainFetcher::new(EthRpc::new(&config).unwrap(), vec![], 12);
        let whale = Market {
            id: "w".into(),
            label: "w".into(),
            market_type: MarketType::Whale,
            address: "0x28C6c06298d514Db089934071355E5743bf21d60".into(),
            description: None,
            base_token: None,
            base_token_index: 0,
            baseline_volume: None,
        };
        let err = fetcher.fetch_events(&whale, 0, 10).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
