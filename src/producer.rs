use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use error_stack::{Report, ResultExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ProducerError;
use crate::exchange::{ExchangeClient, StreamHandle, TradeCallback, ws_chunk_size};
use crate::model::{Candle, CandleBuffer, ExchangeKind, MarketType, TickerDaily, TradeEvent};

const TIMEFRAME_SECONDS: i64 = 3;
const TIMEFRAME_MS: i64 = TIMEFRAME_SECONDS * 1000;
const MAX_HISTORY_SECONDS: i64 = 15 * 60;
const MAX_HISTORY_MS: i64 = MAX_HISTORY_SECONDS * 1000;
const TICKERS_CHECK_INTERVAL: Duration = Duration::from_secs(600);
const TICKER_DAILY_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
const SHARD_STAGGER: Duration = Duration::from_millis(500);

/// Keeps a live, bounded, per-symbol candle buffer and a live 24-hour ticker
/// snapshot; auto-discovers newly listed symbols; exposes read-through
/// accessors for the Consumer.
///
/// Candle/ticker/symbol-set state is guarded by plain `std::sync::Mutex`
/// rather than `tokio::sync::Mutex`: every critical section here is pure
/// computation (no `.await` held across the lock), so a blocking mutex is
/// both correct and lets `ingest_trade` be called directly from the
/// synchronous `TradeCallback` the exchange client invokes.
pub struct Producer {
    client: Arc<dyn ExchangeClient>,
    exchange_kind: ExchangeKind,
    market_type: MarketType,
    candles: Mutex<HashMap<String, CandleBuffer>>,
    ticker_daily: Mutex<HashMap<String, TickerDaily>>,
    symbols: Mutex<HashSet<String>>,
    shard_streams: Mutex<Vec<Arc<dyn StreamHandle>>>,
    shard_tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Producer {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        exchange_kind: ExchangeKind,
        market_type: MarketType,
    ) -> Self {
        Self {
            client,
            exchange_kind,
            market_type,
            candles: Mutex::new(HashMap::new()),
            ticker_daily: Mutex::new(HashMap::new()),
            symbols: Mutex::new(HashSet::new()),
            shard_streams: Mutex::new(Vec::new()),
            shard_tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the startup protocol, then the symbol-discovery and
    /// ticker-daily loops until `stop` is called. Intended to be driven via
    /// `tokio::spawn(Arc::clone(&producer).run())`.
    pub async fn run(self: Arc<Self>) -> Result<(), Report<ProducerError>> {
        self.startup().await?;

        let discovery_task = tokio::spawn({
            let producer = Arc::clone(&self);
            async move { producer.discovery_loop().await }
        });
        let ticker_task = tokio::spawn({
            let producer = Arc::clone(&self);
            async move { producer.ticker_daily_loop().await }
        });

        self.cancel.cancelled().await;
        info!("producer shutdown requested");

        let _ = discovery_task.await;
        let _ = ticker_task.await;

        self.stop_shards().await;

        let shard_tasks: Vec<_> = std::mem::take(&mut *self.shard_tasks.lock().unwrap());
        for task in shard_tasks {
            let _ = task.await;
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn startup(self: &Arc<Self>) -> Result<(), Report<ProducerError>> {
        let chunk_size = ws_chunk_size(self.exchange_kind);
        let batches = self
            .client
            .list_symbols(self.market_type, chunk_size)
            .await
            .change_context(ProducerError::Discovery {
                exchange: self.exchange_kind.to_string(),
            })?;

        {
            let mut symbols = self.symbols.lock().unwrap();
            for batch in &batches {
                symbols.extend(batch.iter().cloned());
            }
        }

        info!(shards = batches.len(), "producer starting websocket shards");

        for (i, batch) in batches.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(SHARD_STAGGER).await;
            }
            self.spawn_shard(batch);
        }

        Ok(())
    }

    fn spawn_shard(self: &Arc<Self>, symbols: Vec<String>) {
        let producer = Arc::clone(self);
        let callback: TradeCallback = Arc::new(move |ev: TradeEvent| producer.ingest_trade(ev));

        let stream: Arc<dyn StreamHandle> =
            Arc::from(self.client.open_aggtrade_stream(symbols, callback, self.cancel.clone()));

        self.shard_streams.lock().unwrap().push(Arc::clone(&stream));

        let task = tokio::spawn(async move {
            if let Err(e) = stream.start().await {
                warn!(error = ?e, "websocket shard terminated");
            }
        });
        self.shard_tasks.lock().unwrap().push(task);
    }

    async fn stop_shards(&self) {
        let shards: Vec<_> = self.shard_streams.lock().unwrap().clone();
        for shard in shards {
            if let Err(e) = shard.stop().await {
                warn!(error = ?e, "error stopping websocket shard");
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICKERS_CHECK_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.discover_new_symbols().await {
                        warn!(error = ?e, "symbol discovery failed, retrying next cycle");
                    }
                }
            }
        }
    }

    async fn discover_new_symbols(self: &Arc<Self>) -> Result<(), Report<ProducerError>> {
        let chunk_size = ws_chunk_size(self.exchange_kind);
        let batches = self
            .client
            .list_symbols(self.market_type, chunk_size)
            .await
            .change_context(ProducerError::Discovery {
                exchange: self.exchange_kind.to_string(),
            })?;
        let all: Vec<String> = batches.into_iter().flatten().collect();

        let new_symbols: Vec<String> = {
            let mut symbols = self.symbols.lock().unwrap();
            let fresh: Vec<String> = all.iter().filter(|s| !symbols.contains(*s)).cloned().collect();
            for s in &fresh {
                symbols.insert(s.clone());
            }
            fresh
        };

        if new_symbols.is_empty() {
            return Ok(());
        }

        info!(
            count = new_symbols.len(),
            "discovered new symbols, starting shard"
        );
        self.spawn_shard(new_symbols);
        Ok(())
    }

    async fn ticker_daily_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICKER_DAILY_UPDATE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_ticker_daily().await {
                        warn!(error = ?e, "ticker-daily refresh failed, keeping last snapshot");
                    }
                }
            }
        }
    }

    async fn refresh_ticker_daily(&self) -> Result<(), Report<ProducerError>> {
        let fresh = self
            .client
            .ticker_24h(self.market_type)
            .await
            .change_context(ProducerError::Discovery {
                exchange: self.exchange_kind.to_string(),
            })?;
        *self.ticker_daily.lock().unwrap() = fresh;
        Ok(())
    }

    /// Fold one trade into its timeframe bucket. Called synchronously from
    /// the exchange client's `TradeCallback`.
    fn ingest_trade(&self, ev: TradeEvent) {
        let aligned_open = ev.trade_time_ms.div_euclid(TIMEFRAME_MS) * TIMEFRAME_MS;

        let mut candles = self.candles.lock().unwrap();
        let buffer = candles.entry(ev.symbol.clone()).or_default();

        match buffer.back_mut() {
            None => buffer.push_back(Candle::new(&ev.symbol, aligned_open, ev.price, ev.quantity)),
            Some(last) => {
                if ev.trade_time_ms >= last.open_time_ms + TIMEFRAME_MS {
                    last.close_time_ms = Some(last.open_time_ms + TIMEFRAME_MS);
                    last.closed = true;
                    buffer.push_back(Candle::new(&ev.symbol, aligned_open, ev.price, ev.quantity));
                } else {
                    last.high = last.high.max(ev.price);
                    last.low = last.low.min(ev.price);
                    last.close = ev.price;
                    last.base_volume += ev.quantity;
                    last.quote_volume += ev.quantity * ev.price;
                }
            }
        }

        while buffer
            .front()
            .is_some_and(|f| f.open_time_ms < aligned_open - MAX_HISTORY_MS)
        {
            buffer.pop_front();
        }
    }

    /// Returns a defensive copy of every symbol's candle buffer.
    pub fn snapshot_candles(&self) -> HashMap<String, CandleBuffer> {
        self.candles.lock().unwrap().clone()
    }

    /// Returns a defensive copy of the 24-hour ticker snapshot.
    pub fn snapshot_ticker_daily(&self) -> HashMap<String, TickerDaily> {
        self.ticker_daily.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Producer {
    /// Test-only seam: seed candle/ticker state directly rather than
    /// round-tripping through a fake WebSocket stream, for Consumer tests
    /// that only care about the read side of the Producer's shared state.
    pub(crate) fn seed_candles(&self, symbol: &str, buffer: CandleBuffer) {
        self.candles.lock().unwrap().insert(symbol.to_owned(), buffer);
    }

    pub(crate) fn seed_ticker_daily(&self, symbol: &str, ticker: TickerDaily) {
        self.ticker_daily
            .lock()
            .unwrap()
            .insert(symbol.to_owned(), ticker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::model::KlineInterval;
    use futures::future::BoxFuture;

    struct NullExchangeClient;

    impl ExchangeClient for NullExchangeClient {
        fn kind(&self) -> ExchangeKind {
            ExchangeKind::Binance
        }

        fn list_symbols(
            &self,
            _market_type: MarketType,
            _chunk_size: usize,
        ) -> BoxFuture<'_, Result<Vec<Vec<String>>, Report<ExchangeError>>> {
            Box::pin(async { Ok(vec![vec!["BTCUSDT".into()]]) })
        }

        fn ticker_24h(
            &self,
            _market_type: MarketType,
        ) -> BoxFuture<'_, Result<HashMap<String, TickerDaily>, Report<ExchangeError>>> {
            Box::pin(async { Ok(HashMap::new()) })
        }

        fn recent_klines(
            &self,
            _symbol: &str,
            _interval: KlineInterval,
            _limit: usize,
        ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn open_aggtrade_stream(
            &self,
            _symbols: Vec<String>,
            _callback: TradeCallback,
            _cancel: CancellationToken,
        ) -> Box<dyn StreamHandle> {
            unimplemented!("not exercised by ingestion unit tests")
        }
    }

    fn producer() -> Producer {
        Producer::new(
            Arc::new(NullExchangeClient),
            ExchangeKind::Binance,
            MarketType::Futures,
        )
    }

    #[test]
    fn single_bucket_fill() {
        let p = producer();
        p.ingest_trade(TradeEvent {
            symbol: "S1".into(),
            trade_time_ms: 1000,
            price: 10.0,
            quantity: 1.0,
        });
        p.ingest_trade(TradeEvent {
            symbol: "S1".into(),
            trade_time_ms: 1500,
            price: 12.0,
            quantity: 2.0,
        });
        p.ingest_trade(TradeEvent {
            symbol: "S1".into(),
            trade_time_ms: 2999,
            price: 8.0,
            quantity: 3.0,
        });

        let snapshot = p.snapshot_candles();
        let buffer = &snapshot["S1"];
        assert_eq!(buffer.len(), 1);
        let k = &buffer[0];
        assert_eq!(k.open_time_ms, 0);
        assert_eq!(k.open, 10.0);
        assert_eq!(k.high, 12.0);
        assert_eq!(k.low, 8.0);
        assert_eq!(k.close, 8.0);
        assert_eq!(k.base_volume, 6.0);
        assert_eq!(k.quote_volume, 10.0 + 24.0 + 24.0);
        assert!(!k.closed);
    }

    #[test]
    fn rollover_finalizes_prior_candle() {
        let p = producer();
        for (t, price, qty) in [(1000, 10.0, 1.0), (1500, 12.0, 2.0), (2999, 8.0, 3.0)] {
            p.ingest_trade(TradeEvent {
                symbol: "S1".into(),
                trade_time_ms: t,
                price,
                quantity: qty,
            });
        }
        p.ingest_trade(TradeEvent {
            symbol: "S1".into(),
            trade_time_ms: 3100,
            price: 11.0,
            quantity: 1.0,
        });

        let snapshot = p.snapshot_candles();
        let buffer = &snapshot["S1"];
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0].close_time_ms, Some(3000));
        assert!(buffer[0].closed);
        let new_candle = &buffer[1];
        assert_eq!(new_candle.open_time_ms, 3000);
        assert_eq!(new_candle.open, 11.0);
        assert_eq!(new_candle.high, 11.0);
        assert_eq!(new_candle.low, 11.0);
        assert_eq!(new_candle.close, 11.0);
        assert_eq!(new_candle.base_volume, 1.0);
        assert_eq!(new_candle.quote_volume, 11.0);
        assert!(!new_candle.closed);
    }

    #[test]
    fn late_trade_folds_into_current_bucket() {
        let p = producer();
        p.ingest_trade(TradeEvent {
            symbol: "S1".into(),
            trade_time_ms: 5000,
            price: 100.0,
            quantity: 1.0,
        });
        p.ingest_trade(TradeEvent {
            symbol: "S1".into(),
            trade_time_ms: 4900,
            price: 90.0,
            quantity: 1.0,
        });

        let snapshot = p.snapshot_candles();
        let buffer = &snapshot["S1"];
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].low, 90.0);
        assert_eq!(buffer[0].base_volume, 2.0);
    }

    #[test]
    fn ohlc_invariant_holds_across_many_trades() {
        let p = producer();
        let mut t = 0i64;
        for i in 0..500 {
            let price = 100.0 + ((i * 37) % 23) as f64 - 11.0;
            p.ingest_trade(TradeEvent {
                symbol: "S1".into(),
                trade_time_ms: t,
                price,
                quantity: 1.0,
            });
            t += 37;
        }

        let snapshot = p.snapshot_candles();
        for k in &snapshot["S1"] {
            assert!(k.low <= k.open.min(k.close));
            assert!(k.open.max(k.close) <= k.high);
            assert!(k.base_volume >= 0.0);
        }
    }

    #[test]
    fn open_times_strictly_increasing() {
        let p = producer();
        let mut t = 0i64;
        for _ in 0..200 {
            p.ingest_trade(TradeEvent {
                symbol: "S1".into(),
                trade_time_ms: t,
                price: 1.0,
                quantity: 1.0,
            });
            t += 500;
        }

        let snapshot = p.snapshot_candles();
        let buffer = &snapshot["S1"];
        for pair in buffer.iter().collect::<Vec<_>>().windows(2) {
            assert!(pair[0].open_time_ms < pair[1].open_time_ms);
        }
    }

    #[test]
    fn buffer_length_bounded_by_history_window() {
        let p = producer();
        let mut t = 0i64;
        // 30 minutes of trades, one every 3 seconds (one per bucket)
        for _ in 0..600 {
            p.ingest_trade(TradeEvent {
                symbol: "S1".into(),
                trade_time_ms: t,
                price: 1.0,
                quantity: 1.0,
            });
            t += TIMEFRAME_MS;
        }

        let snapshot = p.snapshot_candles();
        let buffer = &snapshot["S1"];
        let max_len = (MAX_HISTORY_MS / TIMEFRAME_MS) as usize + 1;
        assert!(buffer.len() <= max_len);
    }

    #[test]
    fn new_symbol_on_existing_shard_accepted_transparently() {
        let p = producer();
        p.ingest_trade(TradeEvent {
            symbol: "UNSEEN".into(),
            trade_time_ms: 0,
            price: 1.0,
            quantity: 1.0,
        });
        assert!(p.snapshot_candles().contains_key("UNSEEN"));
    }
}
