use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::BrokerGateway;
use crate::config::BrokerConfig;
use crate::error::BotError;
use crate::models::{
    AccountInfo, Candle, OrderRequest, PendingOrder, Position, SymbolInfo, Tick, Timeframe,
    TradeResult,
};
use crate::Result;

const INITIAL_BACKOFF_MS: u64 = 500;

type BridgeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Login payload for /connect
#[derive(Debug, Serialize)]
struct ConnectRequest<'a> {
    login: u64,
    password: &'a str,
    server: &'a str,
    path: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ModifyRequest {
    sl: Option<f64>,
    tp: Option<f64>,
}

/// Bar as served by the bridge (epoch seconds)
#[derive(Debug, Deserialize)]
struct BridgeBar {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    tick_volume: f64,
}

#[derive(Debug, Deserialize)]
struct BridgeTick {
    bid: f64,
    ask: f64,
    time: i64,
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// HTTP client for the terminal bridge.
///
/// Every request carries the configured timeout. Reads are retried with
/// exponential backoff; order submissions never are, a repeated send could
/// double an order.
pub struct TerminalBridgeClient {
    client: Client,
    base_url: String,
    config: BrokerConfig,
    rate_limiter: Arc<BridgeRateLimiter>,
    connected: AtomicBool,
}

impl TerminalBridgeClient {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .build()?;

        let rps = NonZeroU32::new(config.max_requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            config,
            rate_limiter,
            connected: AtomicBool::new(false),
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BotError::NotConnected)
        }
    }

    fn transport_error(&self, path: &str, err: reqwest::Error) -> BotError {
        if err.is_timeout() {
            BotError::Timeout(format!("{path} after {}s", self.config.request_timeout_secs))
        } else if err.is_connect() {
            BotError::Connection(format!("{}: {err}", self.base_url))
        } else {
            BotError::Http(err)
        }
    }

    async fn status_error(
        path: &str,
        symbol: Option<&str>,
        response: reqwest::Response,
    ) -> BotError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => {
                BotError::data_unavailable(symbol.unwrap_or("terminal"), path.to_string())
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                BotError::Connection(format!("terminal not initialized: {body}"))
            }
            _ => BotError::InvalidInput(format!("{path} returned {status}: {body}")),
        }
    }

    /// Rate-limited GET with retry on timeouts and server errors
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: Option<&str>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let attempts = self.config.max_retries.max(1);
        let mut last_error = BotError::Connection(format!("no attempt made for {path}"));

        for attempt in 1..=attempts {
            self.rate_limiter.until_ready().await;

            match self.client.get(&url).query(query).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json::<T>().await?);
                }
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    last_error = Self::status_error(path, symbol, response).await;
                    tracing::warn!(
                        "Bridge {} returned {} (attempt {}/{})",
                        path,
                        status,
                        attempt,
                        attempts
                    );
                }
                Ok(response) => return Err(Self::status_error(path, symbol, response).await),
                Err(err) => {
                    tracing::warn!(
                        "Bridge {} failed: {} (attempt {}/{})",
                        path,
                        err,
                        attempt,
                        attempts
                    );
                    last_error = self.transport_error(path, err);
                }
            }

            if attempt < attempts {
                let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        Err(last_error)
    }

    /// Single-shot mutating call
    async fn send<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(path, e))?;
        if !response.status().is_success() {
            return Err(Self::status_error(path, None, response).await);
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl BrokerGateway for TerminalBridgeClient {
    async fn connect(&self) -> Result<AccountInfo> {
        let request = ConnectRequest {
            login: self.config.login,
            password: &self.config.password,
            server: &self.config.server,
            path: self.config.terminal_path.as_deref(),
        };
        let account: AccountInfo = self
            .send(Method::POST, "/connect", Some(&request))
            .await
            .map_err(|e| match e {
                BotError::InvalidInput(msg) => BotError::Connection(msg),
                other => other,
            })?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            "Connected to {} as {} (balance {:.2} {})",
            account.server,
            account.login,
            account.balance,
            account.currency
        );
        Ok(account)
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _: serde_json::Value = self.send::<(), _>(Method::POST, "/disconnect", None).await?;
        Ok(())
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        self.ensure_connected()?;
        self.get("/account", &[], None).await
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        self.ensure_connected()?;
        self.get(&format!("/symbols/{symbol}"), &[], Some(symbol)).await
    }

    async fn tick(&self, symbol: &str) -> Result<Tick> {
        self.ensure_connected()?;
        let tick: BridgeTick = self.get(&format!("/ticks/{symbol}"), &[], Some(symbol)).await?;
        Ok(Tick {
            symbol: symbol.to_string(),
            bid: tick.bid,
            ask: tick.ask,
            time: from_epoch(tick.time),
        })
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>> {
        self.ensure_connected()?;
        let query = [
            ("timeframe", timeframe.as_str().to_string()),
            ("count", count.to_string()),
        ];
        let bars: Vec<BridgeBar> = self
            .get(&format!("/rates/{symbol}"), &query, Some(symbol))
            .await?;
        Ok(bars
            .into_iter()
            .map(|bar| Candle {
                symbol: symbol.to_string(),
                timeframe,
                timestamp: from_epoch(bar.time),
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.tick_volume,
            })
            .collect())
    }

    async fn pending_orders(&self, symbol: Option<&str>) -> Result<Vec<PendingOrder>> {
        self.ensure_connected()?;
        let query: Vec<(&str, String)> = symbol
            .map(|s| ("symbol", s.to_string()))
            .into_iter()
            .collect();
        self.get("/orders", &query, symbol).await
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        self.ensure_connected()?;
        let query: Vec<(&str, String)> = symbol
            .map(|s| ("symbol", s.to_string()))
            .into_iter()
            .collect();
        self.get("/positions", &query, symbol).await
    }

    async fn send_order(&self, request: &OrderRequest) -> Result<TradeResult> {
        self.ensure_connected()?;
        self.send(Method::POST, "/orders", Some(request)).await
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<TradeResult> {
        self.ensure_connected()?;
        let body = ModifyRequest {
            sl: stop_loss,
            tp: take_profit,
        };
        self.send(Method::PATCH, &format!("/positions/{ticket}"), Some(&body))
            .await
    }

    async fn cancel_order(&self, ticket: u64) -> Result<TradeResult> {
        self.ensure_connected()?;
        self.send::<(), _>(Method::DELETE, &format!("/orders/{ticket}"), None)
            .await
    }

    async fn close_position(&self, ticket: u64) -> Result<TradeResult> {
        self.ensure_connected()?;
        self.send::<(), _>(Method::POST, &format!("/positions/{ticket}/close"), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderKind, RetCode};
    use mockito::Matcher;

    fn config(url: String) -> BrokerConfig {
        BrokerConfig {
            login: 5012345,
            password: "secret".to_string(),
            server: "Demo".to_string(),
            bridge_url: url,
            request_timeout_secs: 2,
            max_retries: 2,
            ..BrokerConfig::default()
        }
    }

    const ACCOUNT: &str = r#"{"login":5012345,"server":"Demo","currency":"USD","balance":10000.0,"equity":10000.0,"margin":0.0,"free_margin":10000.0,"leverage":100}"#;

    async fn connected_client(server: &mut mockito::ServerGuard) -> TerminalBridgeClient {
        server
            .mock("POST", "/connect")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(ACCOUNT)
            .create_async()
            .await;
        let client = TerminalBridgeClient::new(config(server.url())).unwrap();
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_calls_require_connect() {
        let client = TerminalBridgeClient::new(config("http://127.0.0.1:9".to_string())).unwrap();
        assert!(matches!(
            client.tick("EURUSD").await,
            Err(BotError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_fetch_candles() {
        let mut server = mockito::Server::new_async().await;
        let client = connected_client(&mut server).await;
        let mock = server
            .mock("GET", "/rates/EURUSD")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeframe".into(), "M30".into()),
                Matcher::UrlEncoded("count".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"time":1710230400,"open":1.1,"high":1.102,"low":1.099,"close":1.101,"tick_volume":120},
                    {"time":1710232200,"open":1.101,"high":1.101,"low":1.1,"close":1.1005,"tick_volume":40}]"#,
            )
            .create_async()
            .await;

        let candles = client.candles("EURUSD", Timeframe::M30, 2).await.unwrap();
        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timeframe, Timeframe::M30);
        assert!((candles[0].range() - 0.003).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_missing_symbol_is_data_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let client = connected_client(&mut server).await;
        server
            .mock("GET", "/ticks/FOOBAR")
            .with_status(404)
            .create_async()
            .await;

        let err = client.tick("FOOBAR").await.unwrap_err();
        assert!(matches!(err, BotError::DataUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_reads_retry_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let client = connected_client(&mut server).await;
        let mock = server
            .mock("GET", "/account")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let result = client.account_info().await;
        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_order_returns_retcode() {
        let mut server = mockito::Server::new_async().await;
        let client = connected_client(&mut server).await;
        let mock = server
            .mock("POST", "/orders")
            .match_body(Matcher::PartialJsonString(
                r#"{"symbol":"EURUSD","comment":"S540"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"retcode":10016,"comment":"Invalid stops"}"#)
            .expect(1)
            .create_async()
            .await;

        let request = OrderRequest::pending("EURUSD", OrderKind::BuyLimit, 0.01, 1.0994)
            .with_comment("S540");
        let result = client.send_order(&request).await.unwrap();
        mock.assert_async().await;
        assert_eq!(result.retcode, RetCode::InvalidStops);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connectivity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/connect")
            .with_status(401)
            .with_body("authorization failed")
            .create_async()
            .await;

        let client = TerminalBridgeClient::new(config(server.url())).unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
