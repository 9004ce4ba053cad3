/// error.rs — Typed failures for the trading core
///
/// The taxonomy mirrors what a caller has to tell apart:
///   ValidationError  : bad local input, never reaches the network
///   ExchangeError    : we could not talk to the exchange (or could not
///                      understand it). On the order path the exchange
///                      saying "no" is NOT an error, it is a non-zero `code`
///                      in the returned envelope; read paths use `Rejected`
///   SignError        : the signer refused its input
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("invalid signing input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("no exchange credentials configured")]
    MissingCredentials,

    #[error(transparent)]
    Signing(#[from] SignError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("exchange rejected request: code {code}: {msg}")]
    Rejected { code: i64, msg: String },
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("leverage {0}x outside allowed range 1..=125")]
    Leverage(u32),

    #[error("take-profit percent must be a positive number, got {0}")]
    TakeProfitPercent(f64),

    #[error("volatility threshold {0} is not one of 0.3, 0.5, 1.0, 1.5")]
    VolatilityThreshold(f64),

    #[error("order quantity must be positive, got {0}")]
    Quantity(f64),

    #[error("not connected: exchange credentials are missing")]
    NotConnected,

    #[error("no mark price observed yet")]
    NoMarkPrice,

    #[error("unknown {field}: {value}")]
    UnknownVariant { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("advisor returned an unusable answer: {0}")]
    Answer(String),

    #[error("advisor timed out after {0} ms")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store I/O on {path}: {source}")]
    Io {
        path:   String,
        source: std::io::Error,
    },

    #[error("credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("credential pair is incomplete")]
    Incomplete,
}
