//! capital_client.rs — Capital.com REST client.
//!
//! Session-token auth: `POST /api/v1/session` with the API key header
//! exchanges credentials for a `CST`/`X-SECURITY-TOKEN` pair that rides
//! along on every subsequent request. Grounded on the original
//! `api/capital_client.py`, extended with the confirm-deal round trip
//! real order placement needs (the original never traded live, so it
//! never had to resolve a `dealReference` to a fill price).

use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use intraday_core::collaborators::{
    AccountSnapshot, AccountSource, BarSource, BrokerPosition, CloseAck, InstrumentSource, OrderAck, OrderRequest, OrderRouter,
};
use intraday_core::error::{EngineError, EngineResult};
use intraday_core::types::{Bar, Direction, InstrumentSpec};

pub struct CapitalClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub identifier: String,
    pub password: String,
}

impl CapitalClientConfig {
    /// Reads `CAPITAL_BASE_URL` (defaults to the demo environment — a live
    /// account must opt in explicitly), `CAPITAL_API_KEY`, `CAPITAL_IDENTIFIER`,
    /// `CAPITAL_PASSWORD` from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(CapitalClientConfig {
            base_url: std::env::var("CAPITAL_BASE_URL").unwrap_or_else(|_| "https://demo-api-capital.backend-capital.com".into()),
            api_key: std::env::var("CAPITAL_API_KEY").context("CAPITAL_API_KEY not set")?,
            identifier: std::env::var("CAPITAL_IDENTIFIER").context("CAPITAL_IDENTIFIER not set")?,
            password: std::env::var("CAPITAL_PASSWORD").context("CAPITAL_PASSWORD not set")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
struct SessionTokens {
    cst: Option<String>,
    security_token: Option<String>,
}

/// A broker-backed collaborator implementing every trait `intraday-core`
/// needs from Capital.com: bars for `BarSource`, balance/positions for
/// `AccountSource`, dealing for `OrderRouter`, and leverage/margin specs
/// for `InstrumentSource`. One client, four traits — the original Python
/// client was the same single object wired into every consumer.
pub struct CapitalClient {
    http: Client,
    cfg: CapitalClientConfig,
    tokens: RwLock<SessionTokens>,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[allow(dead_code)]
    account_id: Option<String>,
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountEntry>,
}

#[derive(Deserialize)]
struct AccountEntry {
    balance: AccountBalance,
}

#[derive(Deserialize)]
struct AccountBalance {
    balance: f64,
    available: f64,
}

#[derive(Deserialize)]
struct PositionsResponse {
    positions: Vec<PositionEntry>,
}

#[derive(Deserialize)]
struct PositionEntry {
    position: PositionDetail,
    market: MarketSummary,
}

#[derive(Deserialize)]
struct PositionDetail {
    #[serde(rename = "dealId")]
    deal_id: String,
    direction: String,
    size: f64,
}

#[derive(Deserialize)]
struct MarketSummary {
    epic: String,
}

#[derive(Deserialize)]
struct PricesResponse {
    prices: Vec<PricePoint>,
}

#[derive(Deserialize)]
struct PricePoint {
    #[serde(rename = "snapshotTimeUTC")]
    snapshot_time_utc: String,
    #[serde(rename = "openPrice")]
    open_price: PriceQuote,
    #[serde(rename = "highPrice")]
    high_price: PriceQuote,
    #[serde(rename = "lowPrice")]
    low_price: PriceQuote,
    #[serde(rename = "closePrice")]
    close_price: PriceQuote,
    #[serde(rename = "lastTradedVolume")]
    last_traded_volume: Option<f64>,
}

#[derive(Deserialize)]
struct PriceQuote {
    bid: Option<f64>,
    ask: Option<f64>,
}

impl PriceQuote {
    /// Capital.com quotes bid/ask, not a single trade price; the engine
    /// works off a single close, so we take the mid.
    fn mid(&self) -> f64 {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => (b + a) / 2.0,
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => 0.0,
        }
    }
}

#[derive(Deserialize)]
struct MarketDetailsResponse {
    instrument: InstrumentDetail,
    #[serde(rename = "dealingRules")]
    dealing_rules: DealingRules,
}

#[derive(Deserialize)]
struct InstrumentDetail {
    #[serde(rename = "lotSize")]
    lot_size: Option<f64>,
    #[serde(rename = "marginFactor")]
    margin_factor: Option<f64>,
}

#[derive(Deserialize)]
struct DealingRules {
    #[serde(rename = "minDealSize")]
    min_deal_size: SizeRule,
    #[serde(rename = "minStepDistance")]
    min_step_distance: Option<SizeRule>,
}

#[derive(Deserialize)]
struct SizeRule {
    value: f64,
}

#[derive(Deserialize)]
struct DealReferenceResponse {
    #[serde(rename = "dealReference")]
    deal_reference: String,
}

#[derive(Deserialize)]
struct ConfirmResponse {
    #[serde(rename = "dealStatus")]
    deal_status: String,
    level: Option<f64>,
    reason: Option<String>,
}

impl CapitalClient {
    pub fn new(cfg: CapitalClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build HTTP client")?;
        Ok(CapitalClient {
            http,
            cfg,
            tokens: RwLock::new(SessionTokens::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url, path)
    }

    fn auth_headers(&self) -> Result<reqwest::header::HeaderMap> {
        let tokens = self.tokens.read().unwrap();
        let (cst, sec) = match (&tokens.cst, &tokens.security_token) {
            (Some(c), Some(s)) => (c.clone(), s.clone()),
            _ => bail!("not authenticated: call authenticate() first"),
        };
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("CST", cst.parse()?);
        headers.insert("X-SECURITY-TOKEN", sec.parse()?);
        Ok(headers)
    }

    /// Exchanges API key + credentials for a session. Call once at
    /// startup; the returned tokens ride on every later request.
    pub async fn authenticate(&self) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/api/v1/session"))
            .header("X-CAP-API-KEY", &self.cfg.api_key)
            .json(&serde_json::json!({
                "identifier": self.cfg.identifier,
                "password": self.cfg.password,
            }))
            .send()
            .await
            .context("session request failed")?;

        if !resp.status().is_success() {
            bail!("Capital.com authentication failed: {}", resp.status());
        }

        let cst = resp.headers().get("CST").and_then(|v| v.to_str().ok()).map(str::to_owned);
        let sec = resp.headers().get("X-SECURITY-TOKEN").and_then(|v| v.to_str().ok()).map(str::to_owned);
        let _body: SessionResponse = resp.json().await.unwrap_or(SessionResponse { account_id: None });

        let (cst, sec) = match (cst, sec) {
            (Some(c), Some(s)) => (c, s),
            _ => bail!("Capital.com session response carried no CST/X-SECURITY-TOKEN headers"),
        };
        let mut tokens = self.tokens.write().unwrap();
        tokens.cst = Some(cst);
        tokens.security_token = Some(sec);
        debug!("Capital.com session established");
        Ok(())
    }

    fn resolution_token(resolution: &str) -> &str {
        match resolution.to_uppercase().as_str() {
            "MINUTE" => "MINUTE",
            "MINUTE_5" | "M5" => "MINUTE_5",
            "MINUTE_15" | "M15" => "MINUTE_15",
            "MINUTE_30" | "M30" => "MINUTE_30",
            "HOUR" => "HOUR",
            "HOUR_4" | "H4" => "HOUR_4",
            "DAY" => "DAY",
            "WEEK" => "WEEK",
            other => other,
        }
        // falls through to whatever the caller configured verbatim; Capital.com
        // rejects unknown tokens with a 400, surfaced as BarDataMalformed below.
    }

    async fn fetch_prices(&self, epic: &str, resolution: &str, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>, max: u32) -> Result<Vec<Bar>> {
        let mut url = format!("{}/api/v1/prices/{}?resolution={}&max={}", self.cfg.base_url, epic, Self::resolution_token(resolution), max);
        if let Some(f) = from {
            url.push_str(&format!("&from={}", f.format("%Y-%m-%dT%H:%M:%S")));
        }
        if let Some(t) = to {
            url.push_str(&format!("&to={}", t.format("%Y-%m-%dT%H:%M:%S")));
        }

        let resp = self
            .http
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .context("prices request failed")?;
        if !resp.status().is_success() {
            bail!("Capital.com prices request for {} failed: {}", epic, resp.status());
        }
        let parsed: PricesResponse = resp.json().await.context("failed to parse prices response")?;

        let mut bars = Vec::with_capacity(parsed.prices.len());
        for p in parsed.prices {
            let ts = DateTime::parse_from_str(&format!("{}Z", p.snapshot_time_utc), "%Y-%m-%dT%H:%M:%S%#z")
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| format!("{}+00:00", p.snapshot_time_utc).parse::<DateTime<Utc>>())
                .unwrap_or_else(|_| Utc::now());
            bars.push(Bar {
                ts,
                open: p.open_price.mid(),
                high: p.high_price.mid(),
                low: p.low_price.mid(),
                close: p.close_price.mid(),
                volume: p.last_traded_volume,
            });
        }
        bars.sort_by_key(|b| b.ts);
        Ok(bars)
    }
}

impl BarSource for CapitalClient {
    fn bars(&self, epic: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> EngineResult<Vec<Bar>> {
        // The engine core is synchronous; block on the tokio runtime the
        // binary already has running (same pattern the live loop uses to
        // drive this trait from inside an async context via `tick()`).
        let handle = tokio::runtime::Handle::try_current();
        let result = match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(self.fetch_prices(epic, "HOUR", Some(from), Some(to), 1000))),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| EngineError::BarDataMissing { epic: epic.into(), ts: e.to_string() })?;
                rt.block_on(self.fetch_prices(epic, "HOUR", Some(from), Some(to), 1000))
            }
        };
        result.map_err(|e| {
            warn!("bar fetch failed for {}: {:#}", epic, e);
            EngineError::BarDataMissing { epic: epic.into(), ts: to.to_rfc3339() }
        })
    }
}

impl CapitalClient {
    /// Live-path companion to [`BarSource::bars`]: the most recent bars
    /// only, no `from` bound. Kept as an inherent method (not part of the
    /// `BarSource` trait, which the simulation loop also implements
    /// against) so the live loop can ask for "whatever's new" without a
    /// synthetic `from` timestamp.
    pub async fn fetch_latest(&self, epic: &str, resolution: &str, max_points: u32) -> Result<Vec<Bar>> {
        self.fetch_prices(epic, resolution, None, None, max_points).await
    }
}

impl AccountSource for CapitalClient {
    fn account(&self) -> EngineResult<AccountSnapshot> {
        let handle = tokio::runtime::Handle::try_current();
        let fut = async {
            let resp = self
                .http
                .get(self.url("/api/v1/accounts"))
                .headers(self.auth_headers().map_err(|e| e.to_string())?)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let parsed: AccountsResponse = resp.json().await.map_err(|e| e.to_string())?;
            parsed.accounts.first().map(|a| (a.balance.balance, a.balance.available)).ok_or_else(|| "no accounts returned".to_string())
        };
        let result = match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(fut)),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
                rt.block_on(fut)
            }
        };
        result
            .map(|(balance, available)| AccountSnapshot { balance, available })
            .map_err(|e| EngineError::InstrumentSpecUnavailable { epic: format!("<account>: {e}") })
    }

    fn open_positions(&self) -> EngineResult<Vec<BrokerPosition>> {
        let handle = tokio::runtime::Handle::try_current();
        let fut = async {
            let resp = self
                .http
                .get(self.url("/api/v1/positions"))
                .headers(self.auth_headers().map_err(|e| e.to_string())?)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let parsed: PositionsResponse = resp.json().await.map_err(|e| e.to_string())?;
            Ok::<_, String>(parsed.positions)
        };
        let result = match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(fut)),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
                rt.block_on(fut)
            }
        };
        let entries = result.map_err(|e| EngineError::InstrumentSpecUnavailable { epic: format!("<positions>: {e}") })?;
        Ok(entries
            .into_iter()
            .map(|e| BrokerPosition {
                epic: e.market.epic,
                units: e.position.size,
                direction: if e.position.direction.eq_ignore_ascii_case("buy") { Direction::Buy } else { Direction::Sell },
            })
            .collect())
    }
}

impl CapitalClient {
    async fn deal_id_for_epic(&self, epic: &str) -> Result<String> {
        let resp = self.http.get(self.url("/api/v1/positions")).headers(self.auth_headers()?).send().await?;
        let parsed: PositionsResponse = resp.json().await?;
        parsed
            .positions
            .into_iter()
            .find(|p| p.market.epic == epic)
            .map(|p| p.position.deal_id)
            .ok_or_else(|| anyhow::anyhow!("no open position for {}", epic))
    }

    async fn confirm_deal(&self, deal_reference: &str) -> Result<f64> {
        let resp = self
            .http
            .get(self.url(&format!("/api/v1/confirms/{deal_reference}")))
            .headers(self.auth_headers()?)
            .send()
            .await?;
        let parsed: ConfirmResponse = resp.json().await.context("failed to parse deal confirmation")?;
        if parsed.deal_status != "ACCEPTED" {
            bail!("deal {} rejected: {}", deal_reference, parsed.reason.unwrap_or_default());
        }
        parsed.level.ok_or_else(|| anyhow::anyhow!("accepted deal carried no fill level"))
    }
}

impl OrderRouter for CapitalClient {
    fn open(&self, req: &OrderRequest) -> EngineResult<OrderAck> {
        let direction = match req.direction {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Neutral => return Err(EngineError::OrderRejected { epic: req.epic.clone(), reason: "neutral direction cannot be routed".into() }),
        };
        let fut = async {
            let resp = self
                .http
                .post(self.url("/api/v1/positions"))
                .headers(self.auth_headers()?)
                .json(&serde_json::json!({
                    "epic": req.epic,
                    "direction": direction,
                    "size": req.units,
                    "stopLevel": req.stop_loss,
                    "profitLevel": req.take_profit,
                }))
                .send()
                .await
                .context("place order request failed")?;
            if !resp.status().is_success() {
                bail!("order rejected with status {}", resp.status());
            }
            let parsed: DealReferenceResponse = resp.json().await.context("failed to parse order response")?;
            let fill_price = self.confirm_deal(&parsed.deal_reference).await?;
            Ok::<_, anyhow::Error>(OrderAck { deal_reference: parsed.deal_reference, fill_price })
        };
        let handle = tokio::runtime::Handle::try_current();
        let result = match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(fut)),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| EngineError::OrderRejected { epic: req.epic.clone(), reason: e.to_string() })?;
                rt.block_on(fut)
            }
        };
        result.map_err(|e| EngineError::OrderRejected { epic: req.epic.clone(), reason: e.to_string() })
    }

    fn close(&self, epic: &str, units: f64) -> EngineResult<CloseAck> {
        let fut = async {
            let deal_id = self.deal_id_for_epic(epic).await?;
            let resp = self
                .http
                .delete(self.url(&format!("/api/v1/positions/{deal_id}")))
                .headers(self.auth_headers()?)
                .json(&serde_json::json!({ "size": units }))
                .send()
                .await
                .context("close order request failed")?;
            if !resp.status().is_success() {
                bail!("close rejected with status {}", resp.status());
            }
            let parsed: DealReferenceResponse = resp.json().await.context("failed to parse close response")?;
            let fill_price = self.confirm_deal(&parsed.deal_reference).await?;
            Ok::<_, anyhow::Error>(CloseAck { fill_price })
        };
        let handle = tokio::runtime::Handle::try_current();
        let result = match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(fut)),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| EngineError::OrderRejected { epic: epic.into(), reason: e.to_string() })?;
                rt.block_on(fut)
            }
        };
        result.map_err(|e| EngineError::OrderRejected { epic: epic.into(), reason: e.to_string() })
    }
}

impl InstrumentSource for CapitalClient {
    fn fetch_spec(&self, epic: &str) -> EngineResult<InstrumentSpec> {
        let fut = async {
            let resp = self
                .http
                .get(self.url(&format!("/api/v1/markets/{epic}")))
                .headers(self.auth_headers()?)
                .send()
                .await
                .context("market details request failed")?;
            if !resp.status().is_success() {
                bail!("market details request for {} failed: {}", epic, resp.status());
            }
            let parsed: MarketDetailsResponse = resp.json().await.context("failed to parse market details")?;
            Ok::<_, anyhow::Error>(InstrumentSpec {
                leverage: parsed.instrument.margin_factor.filter(|f| *f > 0.0).map(|f| 100.0 / f),
                margin_rate: parsed.instrument.margin_factor.map(|f| f / 100.0).unwrap_or(0.05),
                min_size: parsed.dealing_rules.min_deal_size.value,
                step_size: parsed.dealing_rules.min_step_distance.map(|r| r.value).unwrap_or(parsed.dealing_rules.min_deal_size.value),
                precision: parsed.instrument.lot_size.map(|_| 2).unwrap_or(2),
            })
        };
        let handle = tokio::runtime::Handle::try_current();
        let result = match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(fut)),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(|e| EngineError::InstrumentSpecUnavailable { epic: format!("{epic}: {e}") })?;
                rt.block_on(fut)
            }
        };
        result.map_err(|e| {
            warn!("instrument spec unavailable for {}: {:#}", epic, e);
            EngineError::InstrumentSpecUnavailable { epic: epic.into() }
        })
    }
}
