use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::{ExchangeClient, RunningFlag, StreamHandle, TradeCallback};
use crate::model::{Candle, ExchangeKind, KlineInterval, MarketType, TickerDaily, TradeEvent};

const BINANCE_BASE_URL: &str = "https://api.binance.com";
const BINANCE_FAPI_BASE_URL: &str = "https://fapi.binance.com";
const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/stream";
const BINANCE_FWS_BASE: &str = "wss://fstream.binance.com/stream";
const MAX_CANDLES_PER_REQUEST: usize = 1000;
// Reconnect before 24-hour auto-disconnect (23 hours)
const WS_RECONNECT_SECS: u64 = 23 * 60 * 60;
const MAX_BACKOFF_SECS: u64 = 60;
/// Binance kline/ticker endpoints are weighted; 20 req/s stays well under the
/// per-minute budget with margin for the ticker and kline calls combined.
const BINANCE_REQUESTS_PER_SECOND: u32 = 20;

pub struct BinanceExchange {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    market_type: MarketType,
}

impl BinanceExchange {
    pub fn new(market_type: MarketType) -> Self {
        let quota = Quota::per_second(nonzero!(BINANCE_REQUESTS_PER_SECOND));
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            market_type,
        }
    }

    fn rest_base(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => BINANCE_BASE_URL,
            MarketType::Futures => BINANCE_FAPI_BASE_URL,
        }
    }

    fn ws_base(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => BINANCE_WS_BASE,
            MarketType::Futures => BINANCE_FWS_BASE,
        }
    }

    fn exchange_info_path(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "/api/v3/exchangeInfo",
            MarketType::Futures => "/fapi/v1/exchangeInfo",
        }
    }

    fn ticker_24h_path(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "/api/v3/ticker/24hr",
            MarketType::Futures => "/fapi/v1/ticker/24hr",
        }
    }

    fn klines_path(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "/api/v3/klines",
            MarketType::Futures => "/fapi/v1/klines",
        }
    }
}

impl ExchangeClient for BinanceExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    fn list_symbols(
        &self,
        market_type: MarketType,
        chunk_size: usize,
    ) -> BoxFuture<'_, Result<Vec<Vec<String>>, Report<ExchangeError>>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}{}", self.rest_base(), self.exchange_info_path());
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let info: BinanceExchangeInfo =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            let symbols: Vec<String> = info
                .symbols
                .into_iter()
                .filter(|s| s.status == "TRADING")
                .map(|s| s.symbol)
                .collect();

            info!(
                market_type = %market_type,
                count = symbols.len(),
                "binance symbol discovery complete"
            );

            Ok(symbols
                .chunks(chunk_size.max(1))
                .map(|c| c.to_vec())
                .collect())
        })
    }

    fn ticker_24h(
        &self,
        _market_type: MarketType,
    ) -> BoxFuture<'_, Result<HashMap<String, TickerDaily>, Report<ExchangeError>>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}{}", self.rest_base(), self.ticker_24h_path());
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceTicker24h> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            let mut map = HashMap::with_capacity(raw.len());
            for entry in raw {
                map.insert(entry.symbol.clone(), entry.into_ticker_daily());
            }
            Ok(map)
        })
    }

    fn recent_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}{}", self.rest_base(), self.klines_path());
            let fetch_limit = limit.min(MAX_CANDLES_PER_REQUEST);
            let limit_str = fetch_limit.to_string();
            let params = [
                ("symbol", symbol.as_str()),
                ("interval", interval.binance_interval()),
                ("limit", limit_str.as_str()),
            ];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceKlineRow> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            raw.into_iter()
                .map(|row| row.into_candle(&symbol))
                .collect::<Result<Vec<_>, _>>()
        })
    }

    fn open_aggtrade_stream(
        &self,
        symbols: Vec<String>,
        callback: TradeCallback,
        cancel: CancellationToken,
    ) -> Box<dyn StreamHandle> {
        Box::new(BinanceStreamHandle {
            ws_base: self.ws_base(),
            symbols,
            callback,
            cancel,
            running: RunningFlag::new(),
        })
    }
}

struct BinanceStreamHandle {
    ws_base: &'static str,
    symbols: Vec<String>,
    callback: TradeCallback,
    cancel: CancellationToken,
    running: RunningFlag,
}

impl StreamHandle for BinanceStreamHandle {
    fn start(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            self.running.set(true);
            let mut backoff = Duration::from_secs(1);

            loop {
                if self.cancel.is_cancelled() {
                    break;
                }

                match run_aggtrade_ws(
                    self.ws_base,
                    &self.symbols,
                    self.callback.as_ref(),
                    &self.cancel,
                )
                .await
                {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "binance aggtrade ws disconnected, retrying...");
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
                    }
                }
            }

            self.running.set(false);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            self.cancel.cancel();
            Ok(())
        })
    }

    fn running(&self) -> bool {
        self.running.get()
    }
}

async fn run_aggtrade_ws(
    ws_base: &str,
    symbols: &[String],
    callback: &(dyn Fn(TradeEvent) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<(), Report<ExchangeError>> {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@aggTrade", s.to_lowercase()))
        .collect();
    let ws_url = format!("{}?streams={}", ws_base, streams.join("/"));

    let (ws_stream, _) =
        connect_async(&ws_url)
            .await
            .change_context(ExchangeError::Connection {
                exchange: "binance".into(),
            })?;

    let (mut write, mut read) = ws_stream.split();

    info!(symbols = ?symbols, "binance aggtrade ws connected");

    let reconnect_timer = tokio::time::sleep(Duration::from_secs(WS_RECONNECT_SECS));
    tokio::pin!(reconnect_timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("binance aggtrade ws cancelled");
                break;
            }
            _ = &mut reconnect_timer => {
                info!("binance aggtrade ws 23h limit reached, reconnecting");
                return Err(Report::new(ExchangeError::Connection {
                    exchange: "binance (scheduled reconnect)".into(),
                }));
            }
            msg = read.next() => {
                match msg {
                    None => return Err(Report::new(ExchangeError::StreamClosed {
                        exchange: "binance".into(),
                    })),
                    Some(Err(e)) => return Err(Report::new(e)
                        .change_context(ExchangeError::Connection {
                            exchange: "binance".into(),
                        })),
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BinanceCombinedMsg<BinanceAggTradeData>>(&text) {
                            Ok(combined) => callback(combined.data.into_trade_event()),
                            Err(e) => {
                                warn!(error = %e, raw = %text, "binance aggtrade parse error");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    Ok(())
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct BinanceSymbolInfo {
    symbol: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct BinanceTicker24h {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
    #[serde(rename = "priceChangePercent")]
    price_change_percent: String,
}

impl BinanceTicker24h {
    fn into_ticker_daily(self) -> TickerDaily {
        TickerDaily {
            last_price: self.last_price.parse().unwrap_or(0.0),
            quote_volume_24h: self.quote_volume.parse().unwrap_or(0.0),
            price_change_pct_24h: self.price_change_percent.parse().unwrap_or(0.0),
        }
    }
}

/// Binance kline row: 12-element array
/// [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Deserialize)]
struct BinanceKlineRow(
    i64,                        // 0: open_time (ms)
    String,                     // 1: open
    String,                     // 2: high
    String,                     // 3: low
    String,                     // 4: close
    String,                     // 5: volume
    i64,                        // 6: close_time
    String,                     // 7: quote asset volume
    #[allow(dead_code)] i64,    // 8: number of trades
    #[allow(dead_code)] String, // 9: taker buy base volume
    #[allow(dead_code)] String, // 10: taker buy quote volume
    #[allow(dead_code)] String, // 11: ignore
);

impl BinanceKlineRow {
    fn into_candle(self, symbol: &str) -> Result<Candle, Report<ExchangeError>> {
        let parse_f64 = |s: &str| -> Result<f64, Report<ExchangeError>> {
            s.parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "binance".into(),
                })
        };

        Ok(Candle {
            symbol: symbol.to_owned(),
            open_time_ms: self.0,
            close_time_ms: Some(self.6),
            open: parse_f64(&self.1)?,
            high: parse_f64(&self.2)?,
            low: parse_f64(&self.3)?,
            close: parse_f64(&self.4)?,
            base_volume: parse_f64(&self.5)?,
            quote_volume: parse_f64(&self.7)?,
            closed: true,
        })
    }
}

// ── WebSocket message types ───────────────────────────────────────────────────

/// Combined stream wrapper: `{ "stream": "...", "data": { ... } }`
#[derive(Debug, Deserialize)]
struct BinanceCombinedMsg<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct BinanceAggTradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

impl BinanceAggTradeData {
    fn into_trade_event(self) -> TradeEvent {
        TradeEvent {
            symbol: self.symbol,
            trade_time_ms: self.trade_time,
            price: self.price.parse().unwrap_or(0.0),
            quantity: self.quantity.parse().unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_kline_row_parses_into_candle() {
        let row = BinanceKlineRow(
            1704067200000,
            "42000.0".into(),
            "43000.0".into(),
            "41500.0".into(),
            "42500.0".into(),
            "100.5".into(),
            1704067259999,
            "4250000.0".into(),
            10,
            "0".into(),
            "0".into(),
            "0".into(),
        );
        let candle = row.into_candle("BTCUSDT").unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open, 42000.0);
        assert_eq!(candle.close, 42500.0);
        assert_eq!(candle.base_volume, 100.5);
        assert_eq!(candle.quote_volume, 4_250_000.0);
        assert!(candle.closed);
    }

    #[test]
    fn ticker_24h_parses_numeric_strings() {
        let raw = BinanceTicker24h {
            symbol: "ETHUSDT".into(),
            last_price: "3000.50".into(),
            quote_volume: "123456789.0".into(),
            price_change_percent: "-2.5".into(),
        };
        let td = raw.into_ticker_daily();
        assert_eq!(td.last_price, 3000.50);
        assert_eq!(td.quote_volume_24h, 123_456_789.0);
        assert_eq!(td.price_change_pct_24h, -2.5);
    }

    #[test]
    fn aggtrade_data_converts_to_trade_event() {
        let raw = BinanceAggTradeData {
            symbol: "BTCUSDT".into(),
            price: "42000.0".into(),
            quantity: "0.5".into(),
            trade_time: 1704067200000,
        };
        let ev = raw.into_trade_event();
        assert_eq!(ev.symbol, "BTCUSDT");
        assert_eq!(ev.price, 42000.0);
        assert_eq!(ev.quantity, 0.5);
        assert_eq!(ev.trade_time_ms, 1704067200000);
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_list_symbols() {
        let exchange = BinanceExchange::new(MarketType::Futures);
        let batches = exchange
            .list_symbols(MarketType::Futures, 20)
            .await
            .unwrap();
        assert!(!batches.is_empty());
        assert!(batches.iter().all(|b| b.len() <= 20));
    }
}
