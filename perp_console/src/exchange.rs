/// exchange.rs — BingX perpetual swap (V2) REST client
///
/// SIGNED CALL FLOW:
///   1. Build ordered parameters for the call
///   2. Append timestamp (server-synced) and recvWindow
///   3. Sign with HMAC-SHA256 using the API secret
///   4. Send with `X-BX-APIKEY` header, signature last in the query string
///
/// Every response body crosses a strict parsing boundary here: either it
/// decodes into one of the typed shapes below or the call fails with
/// `ExchangeError::Decode`. Nothing untyped leaves this module.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::models::{
    ExchangeResponse, MarginMode, OrderAck, OrderRequest, PositionSide, RawPosition, Ticker,
};
use crate::session::SessionContext;
use crate::signer::{RequestParams, SignedRequest};
use crate::time_sync::TimeSync;

pub const DEFAULT_BASE_URL: &str = "https://open-api.bingx.com";
pub const API_KEY_HEADER: &str = "X-BX-APIKEY";

const TICKER_PATH: &str = "/openApi/swap/v2/quote/ticker";
const ORDER_PATH: &str = "/openApi/swap/v2/trade/order";
const POSITIONS_PATH: &str = "/openApi/swap/v2/user/positions";

/// The three calls the trading core makes against the exchange.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Public ticker. `None` on any failure; callers skip the tick.
    async fn ticker(&self, symbol: &str) -> Option<Ticker>;

    /// Signed order placement. A non-zero `code` is returned, not raised.
    async fn place_order(
        &self,
        order: &OrderRequest,
    ) -> Result<ExchangeResponse<OrderAck>, ExchangeError>;

    /// Signed position list. Empty when no credentials are configured.
    async fn positions(&self) -> Result<Vec<RawPosition>, ExchangeError>;
}

// ── Wire types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg:  String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct WireTicker {
    #[serde(rename = "lastPrice", deserialize_with = "de_f64")]
    last_price:           f64,
    #[serde(rename = "priceChangePercent", deserialize_with = "de_f64")]
    price_change_percent: f64,
    #[serde(rename = "highPrice", deserialize_with = "de_f64")]
    high_price:           f64,
    #[serde(rename = "lowPrice", deserialize_with = "de_f64")]
    low_price:            f64,
    #[serde(deserialize_with = "de_f64")]
    volume:               f64,
}

#[derive(Deserialize)]
struct WireOrderData {
    order: WireOrder,
}

#[derive(Deserialize)]
struct WireOrder {
    #[serde(rename = "orderId")]
    order_id: WireId,
}

#[derive(Deserialize)]
struct WirePosition {
    #[serde(rename = "positionId", default)]
    position_id:       Option<WireId>,
    symbol:            String,
    #[serde(rename = "positionSide")]
    position_side:     String,
    #[serde(rename = "avgPrice", deserialize_with = "de_f64")]
    avg_price:         f64,
    #[serde(rename = "positionAmt", deserialize_with = "de_f64")]
    position_amt:      f64,
    #[serde(deserialize_with = "de_f64")]
    leverage:          f64,
    #[serde(rename = "isolatedMargin", default, deserialize_with = "de_opt_f64")]
    isolated_margin:   Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    margin:            Option<f64>,
    #[serde(rename = "unrealizedProfit", deserialize_with = "de_f64")]
    unrealized_profit: f64,
    #[serde(rename = "marginMode", default)]
    margin_mode:       Option<String>,
    #[serde(default)]
    isolated:          Option<bool>,
}

/// BingX sends ids as numbers on some endpoints and strings on others.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Unsigned(n) => n.to_string(),
            WireId::Signed(n)   => n.to_string(),
            WireId::Text(s)     => s,
        }
    }
}

/// Decimal fields arrive as JSON strings ("50000.1") or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Number(f64),
    Text(String),
}

impl WireNumber {
    fn to_f64<E: de::Error>(&self) -> Result<Option<f64>, E> {
        let v = match self {
            WireNumber::Number(v) => *v,
            WireNumber::Text(s) if s.trim().is_empty() => return Ok(None),
            WireNumber::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| E::custom(format!("bad decimal `{s}`: {e}")))?,
        };
        if v.is_finite() {
            Ok(Some(v))
        } else {
            Err(E::custom("non-finite decimal"))
        }
    }
}

fn de_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    WireNumber::deserialize(d)?
        .to_f64::<D::Error>()?
        .ok_or_else(|| de::Error::custom("empty decimal"))
}

fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<WireNumber>::deserialize(d)? {
        Some(n) => n.to_f64::<D::Error>(),
        None    => Ok(None),
    }
}

// ── Parsing boundary ──────────────────────────────────────────────────────

fn decode_data<T: DeserializeOwned>(what: &str, data: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(data).map_err(|e| ExchangeError::Decode(format!("{what}: {e}")))
}

fn parse_envelope(body: &str) -> Result<Envelope, ExchangeError> {
    serde_json::from_str(body).map_err(|e| ExchangeError::Decode(format!("envelope: {e}")))
}

pub fn parse_ticker(body: &str) -> Result<Ticker, ExchangeError> {
    let env = parse_envelope(body)?;
    if env.code != 0 {
        return Err(ExchangeError::Rejected { code: env.code, msg: env.msg });
    }
    let t: WireTicker = decode_data("ticker", env.data)?;
    Ok(Ticker {
        last_price:           t.last_price,
        price_change_percent: t.price_change_percent,
        high_price:           t.high_price,
        low_price:            t.low_price,
        volume:               t.volume,
    })
}

/// Order envelope; `data` is decoded only when `code == 0`.
///
/// `code` alone decides acceptance. An accepted order whose `data` does not
/// decode still comes back as a success, just without an id.
pub fn parse_order_response(body: &str) -> Result<ExchangeResponse<OrderAck>, ExchangeError> {
    let env = parse_envelope(body)?;
    let data = if env.code == 0 {
        match decode_data::<WireOrderData>("order", env.data) {
            Ok(d) => Some(OrderAck { order_id: d.order.order_id.into_string() }),
            Err(e) => {
                warn!(error = %e, "Order accepted but its id could not be read");
                None
            }
        }
    } else {
        None
    };
    Ok(ExchangeResponse { code: env.code, msg: env.msg, data })
}

pub fn parse_positions(body: &str) -> Result<Vec<RawPosition>, ExchangeError> {
    let env = parse_envelope(body)?;
    if env.code != 0 {
        return Err(ExchangeError::Rejected { code: env.code, msg: env.msg });
    }
    if env.data.is_null() {
        return Ok(Vec::new());
    }
    let wire: Vec<WirePosition> = decode_data("positions", env.data)?;
    wire.into_iter().map(raw_position).collect()
}

fn raw_position(p: WirePosition) -> Result<RawPosition, ExchangeError> {
    let position_side = match p.position_side.to_ascii_uppercase().as_str() {
        "LONG"  => PositionSide::Long,
        "SHORT" => PositionSide::Short,
        "BOTH"  => PositionSide::Both,
        other   => {
            return Err(ExchangeError::Decode(format!("unknown positionSide `{other}`")));
        }
    };
    let margin_mode = match (p.margin_mode.as_deref(), p.isolated) {
        (Some(m), _) => Some(
            m.parse::<MarginMode>()
                .map_err(|e| ExchangeError::Decode(e.to_string()))?,
        ),
        (None, Some(true))  => Some(MarginMode::Isolated),
        (None, Some(false)) => Some(MarginMode::Cross),
        (None, None)        => None,
    };
    if p.leverage < 0.0 || p.leverage > u32::MAX as f64 {
        return Err(ExchangeError::Decode(format!("leverage {} out of range", p.leverage)));
    }
    Ok(RawPosition {
        position_id:       p.position_id.map(WireId::into_string),
        symbol:            p.symbol,
        position_side,
        avg_price:         p.avg_price,
        position_amt:      p.position_amt,
        leverage:          p.leverage.round() as u32,
        isolated_margin:   p.isolated_margin,
        margin:            p.margin,
        unrealized_profit: p.unrealized_profit,
        margin_mode,
    })
}

// ── Client ────────────────────────────────────────────────────────────────

pub struct BingxClient {
    client:         Client,
    base_url:       String,
    recv_window_ms: u64,
    session:        SessionContext,
    time_sync:      TimeSync,
}

impl BingxClient {
    pub fn new(
        base_url:       &str,
        recv_window_ms: u64,
        timeout:        Duration,
        session:        SessionContext,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            recv_window_ms,
            session,
            time_sync: TimeSync::new(),
        })
    }

    /// Sync the signing clock with BingX server time.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        self.time_sync.sync(&self.client, &self.base_url).await
    }

    fn sign(&self, params: RequestParams) -> Result<(String, SignedRequest), ExchangeError> {
        let creds = self.session.credentials().ok_or(ExchangeError::MissingCredentials)?;
        let signed = SignedRequest::new(
            params,
            &creds.api_secret,
            self.time_sync.timestamp_ms(),
            self.recv_window_ms,
        )?;
        Ok((creds.api_key, signed))
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let url = format!("{}{}?symbol={}", self.base_url, TICKER_PATH, symbol);
        let resp = self.client.get(&url).send().await?;
        parse_ticker(&read_body(resp).await?)
    }
}

#[async_trait]
impl Exchange for BingxClient {
    async fn ticker(&self, symbol: &str) -> Option<Ticker> {
        match self.fetch_ticker(symbol).await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(%symbol, error = %e, "Ticker fetch failed");
                None
            }
        }
    }

    async fn place_order(
        &self,
        order: &OrderRequest,
    ) -> Result<ExchangeResponse<OrderAck>, ExchangeError> {
        let (api_key, signed) = self.sign(order.to_params())?;
        let url = format!("{}{}?{}", self.base_url, ORDER_PATH, signed.query_string());

        info!(order = %order, "Placing order");

        let resp = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, api_key)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let parsed = parse_order_response(&read_body(resp).await?)?;
        match &parsed.data {
            Some(ack) if parsed.is_success() => {
                info!(order_id = %ack.order_id, order = %order, "Order accepted");
            }
            _ => warn!(code = parsed.code, msg = %parsed.msg, order = %order, "Order rejected"),
        }
        Ok(parsed)
    }

    async fn positions(&self) -> Result<Vec<RawPosition>, ExchangeError> {
        let (api_key, signed) = match self.sign(RequestParams::new()) {
            Ok(s) => s,
            Err(ExchangeError::MissingCredentials) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let url = format!("{}{}?{}", self.base_url, POSITIONS_PATH, signed.query_string());

        let resp = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?;

        let positions = parse_positions(&read_body(resp).await?)?;
        debug!(count = positions.len(), "Positions fetched");
        Ok(positions)
    }
}

/// Non-2xx bodies still carry a `{code, msg}` envelope on BingX; anything
/// else is a transport problem.
async fn read_body(resp: Response) -> Result<String, ExchangeError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() && parse_envelope(&body).is_err() {
        let snippet: String = body.chars().take(200).collect();
        return Err(ExchangeError::Transport(format!("HTTP {status}: {snippet}")));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_accepts_string_decimals() {
        let body = r#"{"code":0,"msg":"","data":{"symbol":"BTC-USDT","priceChange":"120.5",
            "priceChangePercent":"0.24","lastPrice":"50000.1","lastQty":"0.01",
            "highPrice":"50500","lowPrice":"49100.0","volume":"1234.5","quoteVolume":"61725000",
            "openPrice":"49879.6","openTime":1700000000000,"closeTime":1700086400000}}"#;
        let t = parse_ticker(body).unwrap();
        assert_eq!(t.last_price, 50000.1);
        assert_eq!(t.price_change_percent, 0.24);
        assert_eq!(t.high_price, 50500.0);
        assert_eq!(t.volume, 1234.5);
    }

    #[test]
    fn ticker_shape_mismatch_fails_closed() {
        assert!(matches!(
            parse_ticker(r#"{"code":0,"msg":"","data":{"lastPrice":"abc"}}"#),
            Err(ExchangeError::Decode(_))
        ));
        assert!(matches!(parse_ticker("<html>502</html>"), Err(ExchangeError::Decode(_))));
        assert!(matches!(
            parse_ticker(r#"{"code":100400,"msg":"symbol not exist"}"#),
            Err(ExchangeError::Rejected { code: 100400, .. })
        ));
    }

    #[test]
    fn order_success_extracts_id() {
        let body = r#"{"code":0,"msg":"","data":{"order":{"symbol":"BTC-USDT",
            "orderId":1735950529123455000,"side":"BUY","positionSide":"LONG","type":"MARKET"}}}"#;
        let resp = parse_order_response(body).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.data.unwrap().order_id, "1735950529123455000");
    }

    #[test]
    fn order_rejection_is_a_response_not_an_error() {
        let body = r#"{"code":101204,"msg":"Insufficient margin","data":{}}"#;
        let resp = parse_order_response(body).unwrap();
        assert_eq!(resp.code, 101204);
        assert_eq!(resp.msg, "Insufficient margin");
        assert!(resp.data.is_none());
    }

    #[test]
    fn accepted_order_with_odd_data_stays_accepted() {
        for body in [
            r#"{"code":0,"msg":"","data":{}}"#,
            r#"{"code":0,"msg":"","data":{"orderId":"E9"}}"#,
            r#"{"code":0,"msg":""}"#,
        ] {
            let resp = parse_order_response(body).unwrap();
            assert!(resp.is_success(), "{body}");
            assert!(resp.data.is_none(), "{body}");
        }
        // No envelope at all is still a decode failure.
        assert!(matches!(parse_order_response("<html>502</html>"), Err(ExchangeError::Decode(_))));
    }

    #[test]
    fn positions_parse_mixed_sides() {
        let body = r#"{"code":0,"msg":"","data":[
            {"symbol":"BTC-USDT","positionId":"1001","positionSide":"LONG","isolated":true,
             "positionAmt":"0.002","availableAmt":"0.002","unrealizedProfit":"1.25",
             "realisedProfit":"0","initialMargin":"5.0","isolatedMargin":"5.0",
             "avgPrice":"49800.0","leverage":20},
            {"symbol":"BTC-USDT","positionId":1002,"positionSide":"SHORT","isolated":false,
             "positionAmt":"0.001","unrealizedProfit":"-0.4","margin":"2.5",
             "avgPrice":"50100.0","leverage":"10"}
        ]}"#;
        let ps = parse_positions(body).unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[0].position_side, PositionSide::Long);
        assert_eq!(ps[0].position_id.as_deref(), Some("1001"));
        assert_eq!(ps[0].isolated_margin, Some(5.0));
        assert_eq!(ps[0].margin_mode, Some(MarginMode::Isolated));
        assert_eq!(ps[0].leverage, 20);
        assert_eq!(ps[1].position_side, PositionSide::Short);
        assert_eq!(ps[1].position_id.as_deref(), Some("1002"));
        assert_eq!(ps[1].isolated_margin, None);
        assert_eq!(ps[1].margin, Some(2.5));
        assert_eq!(ps[1].margin_mode, Some(MarginMode::Cross));
    }

    #[test]
    fn positions_null_data_is_empty() {
        assert!(parse_positions(r#"{"code":0,"msg":"","data":null}"#).unwrap().is_empty());
    }

    #[test]
    fn positions_unknown_side_fails_closed() {
        let body = r#"{"code":0,"data":[{"symbol":"BTC-USDT","positionSide":"SIDEWAYS",
            "positionAmt":"1","unrealizedProfit":"0","avgPrice":"1","leverage":1}]}"#;
        assert!(matches!(parse_positions(body), Err(ExchangeError::Decode(_))));
    }

    #[test]
    fn positions_rejection_is_distinguishable() {
        let body = r#"{"code":100001,"msg":"Signature verification failed"}"#;
        assert!(matches!(
            parse_positions(body),
            Err(ExchangeError::Rejected { code: 100001, .. })
        ));
    }

    #[tokio::test]
    async fn positions_without_credentials_is_empty() {
        let client = BingxClient::new(
            "http://127.0.0.1:9",
            5000,
            Duration::from_millis(200),
            SessionContext::in_memory(None),
        )
        .unwrap();
        assert!(client.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn order_without_credentials_fails_before_network() {
        let client = BingxClient::new(
            "http://127.0.0.1:9",
            5000,
            Duration::from_millis(200),
            SessionContext::in_memory(None),
        )
        .unwrap();
        let order = OrderRequest::long_entry("BTC-USDT", 0.001, 20);
        assert!(matches!(
            client.place_order(&order).await,
            Err(ExchangeError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn unreachable_exchange_is_transport_failure() {
        let client = BingxClient::new(
            "http://127.0.0.1:9",
            5000,
            Duration::from_millis(500),
            SessionContext::in_memory(Some(crate::credentials::Credentials::new("k", "s"))),
        )
        .unwrap();
        assert!(client.ticker("BTC-USDT").await.is_none());
        assert!(matches!(client.positions().await, Err(ExchangeError::Transport(_))));
    }
}
