use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::core::{Market, RiskLevel};
use crate::error::ConfigError;
use crate::signals::score::ScoreWeights;
use crate::tags::is_hex_address;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub chain: ChainConfig,
    pub signals: SignalConfig,
    pub monitor: MonitorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub sink: SinkConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub lookback_blocks: u64,
    /// Used to estimate log timestamps when the node omits `blockTimestamp`.
    pub block_time_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalConfig {
    pub weights: WeightConfig,
    pub weight_tolerance: f64,
    pub baseline_volume: f64,
    pub baseline_liquidity_ratio: f64,
    pub busy_trade_count: u64,
    pub whale_threshold: f64,
    pub whale_seller_count: u64,
    /// Stand-in for pool reserves when `getReserves()` is unavailable.
    pub reference_liquidity: f64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct WeightConfig {
    pub dex: f64,
    pub whale: f64,
    pub cex: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub max_concurrency: usize,
    pub stop_timeout_secs: u64,
    pub persist_swaps: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub markets_path: String,
    pub exchange_csv: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub enabled: bool,
    pub contract_address: Option<String>,
    pub chain_id: u64,
    pub gas_limit: u64,
    /// Upper bound on one `updateRisk` submission.
    pub submit_timeout_secs: u64,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub private_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub min_level: u8,
    pub cooldown_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            signals: SignalConfig::default(),
            monitor: MonitorConfig::default(),
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
            sink: SinkConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            rpc_user: None,
            rpc_password: None,
            lookback_blocks: 2000,
            block_time_secs: 12,
            request_timeout_secs: 10,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            weights: WeightConfig::default(),
            weight_tolerance: 0.05,
            baseline_volume: 1e21,
            baseline_liquidity_ratio: 0.01,
            busy_trade_count: 200,
            whale_threshold: 1e20,
            whale_seller_count: 3,
            reference_liquidity: 1e24,
        }
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            dex: 0.40,
            whale: 0.35,
            cex: 0.30,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_concurrency: 8,
            stop_timeout_secs: 30,
            persist_swaps: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/chainmonitor.db".into(),
            markets_path: "markets.json".into(),
            exchange_csv: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8000,
            allowed_origins: vec![
                "http://localhost:3000".into(),
                "http://localhost:5173".into(),
            ],
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            contract_address: None,
            chain_id: 11155111,
            gas_limit: 300_000,
            submit_timeout_secs: 20,
            private_key: None,
        }
    }
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("enabled", &self.enabled)
            .field("contract_address", &self.contract_address)
            .field("chain_id", &self.chain_id)
            .field("gas_limit", &self.gas_limit)
            .field("submit_timeout_secs", &self.submit_timeout_secs)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_level: 2,
            cooldown_seconds: 30,
        }
    }
}

impl SinkConfig {
    /// Signing key and contract address are both required to write on-chain.
    pub fn is_active(&self) -> bool {
        self.enabled && self.private_key.is_some() && self.contract_address.is_some()
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't
    /// exist; a file that exists but can't be read or parsed is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Config loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply secrets and endpoint overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()));
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(url) = get("RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Some(user) = get("RPC_USER") {
            self.chain.rpc_user = Some(user);
        }
        if let Some(password) = get("RPC_PASSWORD") {
            self.chain.rpc_password = Some(password);
        }
        if let Some(key) = get("PRIVATE_KEY") {
            self.sink.private_key = Some(key);
        }
        if let Some(address) = get("RISK_MONITOR_ADDRESS") {
            self.sink.contract_address = Some(address);
        }
        if let Some(path) = get("DATABASE_PATH") {
            self.database.path = path;
        }
    }

    pub fn weights(&self) -> Result<ScoreWeights, ConfigError> {
        let w = self.signals.weights;
        Ok(ScoreWeights::new(w.dex, w.whale, w.cex, self.signals.weight_tolerance)?)
    }

    /// Read and validate the market list.
    pub fn load_markets(&self) -> Result<Vec<Market>, ConfigError> {
        let path = Path::new(&self.database.markets_path);
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        parse_markets(&contents).map_err(|e| match e {
            ConfigError::Markets { source, .. } => ConfigError::Markets {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    /// Checks everything that must hold before the monitor may start.
    pub fn validate(&self, markets: &[Market]) -> Result<(), ConfigError> {
        if self.chain.rpc_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "missing RPC endpoint (set chain.rpc_url or RPC_URL)".into(),
            ));
        }
        if self.chain.lookback_blocks == 0 {
            return Err(ConfigError::Invalid("chain.lookback_blocks must be > 0".into()));
        }
        if self.sink.submit_timeout_secs == 0 {
            return Err(ConfigError::Invalid("sink.submit_timeout_secs must be > 0".into()));
        }
        self.validate_offline(markets)
    }

    /// The subset that still matters when only the query API runs: no chain
    /// access is needed.
    pub fn validate_offline(&self, markets: &[Market]) -> Result<(), ConfigError> {
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor.interval_secs must be > 0".into()));
        }
        if self.monitor.max_concurrency == 0 {
            return Err(ConfigError::Invalid("monitor.max_concurrency must be > 0".into()));
        }
        if RiskLevel::from_u8(self.notifications.min_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "notifications.min_level {} is not a risk level",
                self.notifications.min_level
            )));
        }
        self.weights()?;
        if let Some(address) = &self.sink.contract_address {
            if !is_hex_address(address) {
                return Err(ConfigError::Invalid(format!(
                    "sink.contract_address {address} is not an address"
                )));
            }
        }
        validate_markets(markets)
    }
}

/// Parse `markets.json`. Entries without an `id` use their label.
pub fn parse_markets(contents: &str) -> Result<Vec<Market>, ConfigError> {
    let mut markets: Vec<Market> =
        serde_json::from_str(contents).map_err(|source| ConfigError::Markets {
            path: "<inline>".into(),
            source,
        })?;
    for market in &mut markets {
        if market.id.trim().is_empty() {
            market.id = market.label.clone();
        }
    }
    Ok(markets)
}

pub fn validate_markets(markets: &[Market]) -> Result<(), ConfigError> {
    if !markets.iter().any(Market::is_monitored) {
        return Err(ConfigError::Invalid(
            "market list has no entry with type dex_pool".into(),
        ));
    }
    let mut seen = HashSet::new();
    for market in markets {
        if !is_hex_address(&market.address) {
            return Err(ConfigError::Invalid(format!(
                "market {} has invalid address {}",
                market.id, market.address
            )));
        }
        if market.base_token_index > 1 {
            return Err(ConfigError::Invalid(format!(
                "market {} base_token_index must be 0 or 1",
                market.id
            )));
        }
        if let Some(token) = &market.base_token {
            if !is_hex_address(token) {
                return Err(ConfigError::Invalid(format!(
                    "market {} has invalid base_token {token}",
                    market.id
                )));
            }
        }
        if market.is_monitored() && !seen.insert(market.id.clone()) {
            return Err(ConfigError::Invalid(format!("duplicate market id {}", market.id)));
        }
    }
    Ok(())
}
