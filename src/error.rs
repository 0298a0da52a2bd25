use thiserror::Error;

/// Failure while pulling events from the RPC node.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeouts, rate limits, connection resets. Worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Bad address, unsupported market, rejected request. Retrying won't help.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Malformed event data handed to an aggregator.
#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("event for market {found} passed to aggregation of {expected}")]
    ForeignEvent { expected: String, found: String },

    #[error("swap at block {block} log {log_index} moves no tokens")]
    EmptySwap { block: u64, log_index: u64 },

    #[error("transfer at block {block} log {log_index} has zero amount")]
    EmptyTransfer { block: u64, log_index: u64 },
}

/// Invalid scoring weights. Only raised at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ScoreConfigError {
    #[error("weight {name} = {value} is outside [0, 1]")]
    WeightOutOfRange { name: &'static str, value: f64 },

    #[error("weights sum to {sum}, expected 1.0 ± {tolerance}")]
    WeightSum { sum: f64, tolerance: f64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database task failed: {0}")]
    Task(String),

    #[error("snapshot for {market_id} at {timestamp_ms} is not after the last one ({last_ms})")]
    NonMonotonic {
        market_id: String,
        timestamp_ms: i64,
        last_ms: i64,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Failure submitting a level update to the risk contract. Never fatal.
#[derive(Debug, Error)]
pub enum ChainSubmitError {
    #[error("signer setup failed: {0}")]
    Signer(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("contract call failed: {0}")]
    Contract(String),

    #[error("submission timed out after {0}s")]
    Timeout(u64),
}

/// Startup configuration problems. All of these abort the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("malformed market list {path}: {source}")]
    Markets {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Weights(#[from] ScoreConfigError),
}

/// Why one market's pass in a cycle produced no snapshot.
#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("market {0} is not registered with the monitor")]
    UnknownMarket(String),

    #[error("pass abandoned at shutdown")]
    Abandoned,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("failed to bind API server: {0}")]
    Bind(#[from] warp::Error),
}
