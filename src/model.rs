use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange this crate knows how to talk to.
///
/// Only `Binance` has a concrete `ExchangeClient`; `Bingx` exists purely so
/// the `WS_CHUNK_SIZE` override table in [`crate::producer`] has something
/// other than the default to override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Binance,
    Bingx,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Bingx => write!(f, "bingx"),
        }
    }
}

impl ExchangeKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "bingx" => Some(Self::Bingx),
            _ => None,
        }
    }
}

/// Spot vs. derivatives market on an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Spot,
    Futures,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Futures => write!(f, "futures"),
        }
    }
}

impl MarketType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Some(Self::Spot),
            "futures" => Some(Self::Futures),
            _ => None,
        }
    }
}

/// REST kline interval, used only for the chart-context fetch (`recent_klines`).
///
/// Distinct from the Producer's internal 3-second aggregation timeframe,
/// which is not configurable and has no REST equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KlineInterval {
    Min1,
    Min5,
    Min15,
    Hour1,
}

impl KlineInterval {
    pub fn binance_interval(self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Hour1 => "1h",
        }
    }
}

/// One timeframe bucket of trades for one symbol.
///
/// `low <= open <= high`, `low <= close <= high`, `base_volume >= 0`, and
/// `open_time_ms` is a multiple of the aggregation timeframe. Only the last
/// candle in a [`CandleBuffer`] is mutable; everything before it is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open_time_ms: i64,
    pub close_time_ms: Option<i64>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub closed: bool,
}

impl Candle {
    pub fn new(symbol: &str, open_time_ms: i64, price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_owned(),
            open_time_ms,
            close_time_ms: None,
            open: price,
            high: price,
            low: price,
            close: price,
            base_volume: quantity,
            quote_volume: quantity * price,
            closed: false,
        }
    }
}

/// Per-symbol ordered sequence of candles. The front is evicted as history
/// ages past `MAX_HISTORY_MS`; only the back element is ever mutated.
pub type CandleBuffer = VecDeque<Candle>;

/// A single aggregated trade delivered by the exchange's WebSocket feed.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub symbol: String,
    pub trade_time_ms: i64,
    pub price: f64,
    pub quantity: f64,
}

/// 24-hour rolling snapshot for one symbol, replaced wholesale on refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickerDaily {
    pub last_price: f64,
    pub quote_volume_24h: f64,
    pub price_change_pct_24h: f64,
}

/// Hot-reloadable runtime settings, backed by the single-row `settings` table.
#[derive(Debug, Clone)]
pub struct Settings {
    pub id: i32,
    pub interval_seconds: i64,
    pub min_multiplier: f64,
    pub timeout_seconds: i64,
    pub chat_id: Option<i64>,
    pub bot_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Settings {
    /// All four numeric fields positive and both notification fields present.
    pub fn is_ready(&self) -> bool {
        self.interval_seconds > 0
            && self.min_multiplier > 0.0
            && self.timeout_seconds > 0
            && self.chat_id.is_some()
            && self.bot_token.is_some()
    }

    pub fn defaults() -> Self {
        Self {
            id: 1,
            interval_seconds: 60,
            min_multiplier: 50.0,
            timeout_seconds: 60,
            chat_id: None,
            bot_token: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_round_trip() {
        assert_eq!(ExchangeKind::from_str("binance"), Some(ExchangeKind::Binance));
        assert_eq!(ExchangeKind::from_str("BINGX"), Some(ExchangeKind::Bingx));
        assert_eq!(ExchangeKind::from_str("huobi"), None);
        assert_eq!(ExchangeKind::Binance.to_string(), "binance");
    }

    #[test]
    fn market_type_round_trip() {
        assert_eq!(MarketType::from_str("spot"), Some(MarketType::Spot));
        assert_eq!(MarketType::from_str("FUTURES"), Some(MarketType::Futures));
        assert_eq!(MarketType::from_str("margin"), None);
    }

    #[test]
    fn settings_is_ready_requires_all_fields() {
        let mut s = Settings::defaults();
        assert!(!s.is_ready());
        s.chat_id = Some(123);
        assert!(!s.is_ready());
        s.bot_token = Some("token".into());
        assert!(s.is_ready());
        s.interval_seconds = 0;
        assert!(!s.is_ready());
    }

    #[test]
    fn candle_new_initializes_ohlc_to_trade_price() {
        let c = Candle::new("BTCUSDT", 3000, 100.0, 2.0);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 100.0);
        assert_eq!(c.low, 100.0);
        assert_eq!(c.close, 100.0);
        assert_eq!(c.base_volume, 2.0);
        assert_eq!(c.quote_volume, 200.0);
        assert!(!c.closed);
        assert!(c.close_time_ms.is_none());
    }
}
