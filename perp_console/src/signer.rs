/// signer.rs — HMAC-SHA256 request signing for BingX swap V2
///
/// SIGNED REQUEST LAYOUT:
///   k1=v1&k2=v2&...&timestamp=T&recvWindow=W&signature=HEX
///
/// The signature covers everything before `&signature=` byte for byte, so
/// the parameters must be transmitted in exactly the order they were signed.
/// `RequestParams` keeps insertion order for that reason; swapping two keys
/// produces a different signature and the exchange rejects the request.
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SignError;

type HmacSha256 = Hmac<Sha256>;

/// Server-side tolerance between our timestamp and request arrival.
pub const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

/// Insertion-ordered request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams(Vec<(String, String)>);

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn with_opt(self, key: impl Into<String>, value: Option<String>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None    => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request bound to one timestamp. Build a new one for every send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    params:      RequestParams,
    timestamp:   i64,
    recv_window: u64,
    signature:   String,
}

impl SignedRequest {
    pub fn new(
        params:      RequestParams,
        secret:      &str,
        timestamp:   i64,
        recv_window: u64,
    ) -> Result<Self, SignError> {
        let signature = sign(&params, secret, timestamp, recv_window)?;
        Ok(Self { params, timestamp, recv_window, signature })
    }

    pub fn params(&self) -> &RequestParams {
        &self.params
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn recv_window(&self) -> u64 {
        self.recv_window
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Full query string with the signature appended last.
    pub fn query_string(&self) -> String {
        format!(
            "{}&signature={}",
            canonical_query(&self.params, self.timestamp, self.recv_window),
            self.signature
        )
    }
}

/// Sign `params ∪ {timestamp, recvWindow}` with `secret`.
///
/// An empty parameter set is allowed (the positions read signs only the
/// timestamp pair); empty keys/values and embedded delimiters are not.
pub fn sign(
    params:      &RequestParams,
    secret:      &str,
    timestamp:   i64,
    recv_window: u64,
) -> Result<String, SignError> {
    if secret.is_empty() {
        return Err(SignError::InvalidInput("secret is empty".into()));
    }
    if timestamp <= 0 {
        return Err(SignError::InvalidInput(format!("timestamp {timestamp} is not positive")));
    }
    if recv_window == 0 {
        return Err(SignError::InvalidInput("recvWindow must be positive".into()));
    }
    for (k, v) in params.iter() {
        validate_component("key", k)?;
        validate_component("value", v)?;
        if k == "timestamp" || k == "recvWindow" || k == "signature" {
            return Err(SignError::InvalidInput(format!("reserved parameter `{k}`")));
        }
    }

    hmac_hex(&canonical_query(params, timestamp, recv_window), secret)
}

/// Lowercase hex HMAC-SHA256 of `payload` keyed by `secret`.
pub fn hmac_hex(payload: &str, secret: &str) -> Result<String, SignError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignError::InvalidInput(format!("HMAC key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn canonical_query(params: &RequestParams, timestamp: i64, recv_window: u64) -> String {
    let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.push(format!("timestamp={timestamp}"));
    parts.push(format!("recvWindow={recv_window}"));
    parts.join("&")
}

fn validate_component(what: &str, s: &str) -> Result<(), SignError> {
    if s.is_empty() {
        return Err(SignError::InvalidInput(format!("empty parameter {what}")));
    }
    if s.chars().any(|c| c == '&' || c == '=' || c == '#' || c.is_whitespace()) {
        return Err(SignError::InvalidInput(format!("malformed parameter {what} `{s}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "mheO6dR8ovSsxZQCOYEFCtelpuxcWGTfHw7te326y6jOwq5WpvFQ9JNljoTwBXZGv5It07m9RXSPpDQEK2w";

    fn order_params() -> RequestParams {
        RequestParams::new()
            .with("symbol", "BTC-USDT")
            .with("side", "BUY")
            .with("positionSide", "LONG")
            .with("type", "MARKET")
            .with("quantity", "0.001")
    }

    #[test]
    fn hmac_matches_published_vector() {
        // Binance API docs example (same HMAC-SHA256/hex scheme).
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query  = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            hmac_hex(query, secret).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn sign_is_deterministic() {
        let a = sign(&order_params(), SECRET, 1_700_000_000_000, 5000).unwrap();
        let b = sign(&order_params(), SECRET, 1_700_000_000_000, 5000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn key_order_changes_signature() {
        let ab = RequestParams::new().with("symbol", "BTC-USDT").with("side", "BUY");
        let ba = RequestParams::new().with("side", "BUY").with("symbol", "BTC-USDT");
        let s1 = sign(&ab, SECRET, 1_700_000_000_000, 5000).unwrap();
        let s2 = sign(&ba, SECRET, 1_700_000_000_000, 5000).unwrap();
        assert_ne!(s1, s2);
    }

    #[test]
    fn timestamp_changes_signature() {
        let s1 = sign(&order_params(), SECRET, 1_700_000_000_000, 5000).unwrap();
        let s2 = sign(&order_params(), SECRET, 1_700_000_000_001, 5000).unwrap();
        assert_ne!(s1, s2);
    }

    #[test]
    fn signature_covers_exact_query_prefix() {
        let req = SignedRequest::new(order_params(), SECRET, 1_700_000_000_000, 5000).unwrap();
        let qs  = req.query_string();
        let (prefix, sig) = qs.rsplit_once("&signature=").unwrap();
        assert_eq!(
            prefix,
            "symbol=BTC-USDT&side=BUY&positionSide=LONG&type=MARKET&quantity=0.001&timestamp=1700000000000&recvWindow=5000"
        );
        assert_eq!(sig, req.signature());
        assert_eq!(hmac_hex(prefix, SECRET).unwrap(), sig);
    }

    #[test]
    fn empty_param_set_signs_timestamp_only() {
        let req = SignedRequest::new(RequestParams::new(), SECRET, 1_700_000_000_000, 5000).unwrap();
        assert!(req.query_string().starts_with("timestamp=1700000000000&recvWindow=5000&signature="));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            sign(&order_params(), "", 1_700_000_000_000, 5000),
            Err(SignError::InvalidInput(_))
        ));
        let empty_value = RequestParams::new().with("symbol", "");
        assert!(sign(&empty_value, SECRET, 1_700_000_000_000, 5000).is_err());
        let injected = RequestParams::new().with("symbol", "BTC-USDT&side=SELL");
        assert!(sign(&injected, SECRET, 1_700_000_000_000, 5000).is_err());
        let reserved = RequestParams::new().with("timestamp", "1");
        assert!(sign(&reserved, SECRET, 1_700_000_000_000, 5000).is_err());
        assert!(sign(&order_params(), SECRET, 0, 5000).is_err());
        assert!(sign(&order_params(), SECRET, 1_700_000_000_000, 0).is_err());
    }
}
