use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use crate::error::ExchangeError;

#[derive(Deserialize)]
struct ServerTimeEnvelope {
    code: i64,
    #[serde(default)]
    msg:  String,
    data: Option<ServerTimeData>,
}

#[derive(Deserialize)]
struct ServerTimeData {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

/// Offset between the exchange clock and ours, applied to signed timestamps
/// so they stay inside the receive window.
#[derive(Debug, Default)]
pub struct TimeSync {
    offset_ms: AtomicI64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync with BingX server time
    pub async fn sync(&self, client: &Client, base_url: &str) -> Result<i64, ExchangeError> {
        let url = format!("{}/openApi/swap/v2/server/time", base_url);

        // Measure round-trip time
        let local_before = Utc::now().timestamp_millis();

        let response: ServerTimeEnvelope = client
            .get(&url)
            .send()
            .await?
            .json()
            .await?;

        let local_after = Utc::now().timestamp_millis();

        let server_time = match (response.code, response.data) {
            (0, Some(d)) => d.server_time,
            (code, _) => {
                return Err(ExchangeError::Decode(format!(
                    "server time: code {code} {}",
                    response.msg
                )))
            }
        };

        // Calculate offset (server_time - estimated_local_time)
        let offset = estimate_offset(local_before, local_after, server_time);
        self.offset_ms.store(offset, Ordering::Relaxed);

        info!(offset_ms = offset, "Time sync");
        Ok(offset)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Get server-synced timestamp in milliseconds
    pub fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.offset_ms()
    }
}

fn estimate_offset(local_before: i64, local_after: i64, server_time: i64) -> i64 {
    let round_trip = local_after - local_before;
    let estimated_local = local_before + round_trip / 2;
    server_time - estimated_local
}
