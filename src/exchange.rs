pub mod binance;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::ExchangeError;
use crate::model::{Candle, ExchangeKind, KlineInterval, MarketType, TickerDaily, TradeEvent};

/// Default WebSocket shard size, overridden per exchange below.
pub const DEFAULT_WS_CHUNK_SIZE: usize = 20;

/// Per-exchange shard-size override, ported from the original screener's
/// exchange configuration table.
pub fn ws_chunk_size(exchange: ExchangeKind) -> usize {
    match exchange {
        ExchangeKind::Bingx => 30,
        ExchangeKind::Binance => DEFAULT_WS_CHUNK_SIZE,
    }
}

/// Callback invoked by a [`StreamHandle`] for every ingested trade.
pub type TradeCallback = Arc<dyn Fn(TradeEvent) + Send + Sync>;

/// A running (or stopped) aggregated-trade WebSocket subscription.
///
/// Uses `BoxFuture` instead of `async fn` in trait to keep the trait
/// object-safe (`dyn StreamHandle`).
pub trait StreamHandle: Send + Sync {
    /// Run the connect/read/reconnect loop until `stop` is called or the
    /// stream ends on its own. Safe to await from a spawned task.
    fn start(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>>;

    /// Request the stream to stop; `start`'s loop observes this and returns.
    fn stop(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>>;

    fn running(&self) -> bool;
}

/// Abstraction over a cryptocurrency exchange's REST and WebSocket surface.
///
/// Uses `BoxFuture` (from the `futures` crate) instead of `async fn` in
/// trait to keep the trait object-safe (`dyn ExchangeClient`).
pub trait ExchangeClient: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// List all symbols for `market_type`, already partitioned into batches
    /// of at most `chunk_size` symbols each.
    fn list_symbols(
        &self,
        market_type: MarketType,
        chunk_size: usize,
    ) -> BoxFuture<'_, Result<Vec<Vec<String>>, Report<ExchangeError>>>;

    /// Fetch the full 24-hour ticker snapshot for every symbol.
    fn ticker_24h(
        &self,
        market_type: MarketType,
    ) -> BoxFuture<'_, Result<std::collections::HashMap<String, TickerDaily>, Report<ExchangeError>>>;

    /// Fetch recent klines for chart context.
    fn recent_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>>;

    /// Open an aggregated-trade stream for `symbols`, invoking `callback` for
    /// each trade. Returns a handle; the caller is responsible for calling
    /// `start()` on it (typically in a spawned task) and `stop()` on shutdown.
    fn open_aggtrade_stream(
        &self,
        symbols: Vec<String>,
        callback: TradeCallback,
        cancel: CancellationToken,
    ) -> Box<dyn StreamHandle>;
}

/// Shared `running` flag backing a [`StreamHandle`] implementation.
#[derive(Clone)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for RunningFlag {
    fn default() -> Self {
        Self::new()
    }
}
