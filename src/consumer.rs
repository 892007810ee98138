use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::chart;
use crate::error::ConsumerError;
use crate::exchange::ExchangeClient;
use crate::model::{CandleBuffer, ExchangeKind, KlineInterval, MarketType, Settings};
use crate::notifier::Notifier;
use crate::producer::Producer;
use crate::text;

const EVAL_TICK: Duration = Duration::from_secs(1);
const CHART_CONTEXT_CANDLES: usize = 500;

/// Per-symbol earliest-allowed-signal time. Eviction is lazy: a read past
/// the expiry treats the entry as absent rather than proactively sweeping it.
#[derive(Default)]
struct CooldownMap(HashMap<String, DateTime<Utc>>);

impl CooldownMap {
    fn is_blocked(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.0.get(symbol).is_some_and(|expiry| now < *expiry)
    }

    fn block_until(&mut self, symbol: &str, expiry: DateTime<Utc>) {
        self.0.insert(symbol.to_owned(), expiry);
    }
}

/// Periodic evaluator: on each `EVAL_TICK`, computes the volume multiplier
/// for every symbol against the Producer's shared state and dispatches a
/// notification for anything crossing `min_multiplier` and out of cooldown.
pub struct Consumer {
    producer: Arc<Producer>,
    client: Arc<dyn ExchangeClient>,
    notifier: Arc<dyn Notifier>,
    exchange_kind: ExchangeKind,
    market_type: MarketType,
    settings: Mutex<Settings>,
    cooldown: Mutex<CooldownMap>,
    signal_counts: Mutex<HashMap<String, u64>>,
    cancel: CancellationToken,
}

impl Consumer {
    pub fn new(
        producer: Arc<Producer>,
        client: Arc<dyn ExchangeClient>,
        notifier: Arc<dyn Notifier>,
        exchange_kind: ExchangeKind,
        market_type: MarketType,
        initial_settings: Settings,
    ) -> Self {
        Self {
            producer,
            client,
            notifier,
            exchange_kind,
            market_type,
            settings: Mutex::new(initial_settings),
            cooldown: Mutex::new(CooldownMap::default()),
            signal_counts: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Atomic field/pointer swap — readers of an in-flight tick see either
    /// the old or the new settings, never a torn mix.
    pub fn update_settings(&self, settings: Settings) {
        *self.settings.lock().unwrap() = settings;
    }

    fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the evaluation loop until `stop` is called.
    pub async fn run(self: Arc<Self>) -> Result<(), Report<ConsumerError>> {
        let mut ticker = tokio::time::interval(EVAL_TICK);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("consumer shutdown requested");
        if let Err(e) = self.notifier.close().await {
            warn!(error = ?e, "failed to close notifier during consumer shutdown");
        }
        Ok(())
    }

    async fn tick(self: &Arc<Self>) {
        let settings = self.settings();
        if !settings.is_ready() {
            return;
        }

        let candles_snapshot = self.producer.snapshot_candles();
        let ticker_snapshot = self.producer.snapshot_ticker_daily();
        let now = Utc::now();

        let mut tasks = Vec::new();
        for (symbol, buffer) in candles_snapshot {
            if self.cooldown.lock().unwrap().is_blocked(&symbol, now) {
                continue;
            }

            let Some(daily) = ticker_snapshot.get(&symbol) else {
                warn!(symbol = %symbol, "no 24h ticker snapshot for symbol, skipping tick");
                continue;
            };

            let multiplier = compute_multiplier(
                &buffer,
                daily.quote_volume_24h,
                settings.interval_seconds,
                now,
            );

            if multiplier <= settings.min_multiplier {
                continue;
            }

            let expiry = now + chrono::Duration::seconds(settings.timeout_seconds);
            self.cooldown.lock().unwrap().block_until(&symbol, expiry);
            let count = {
                let mut counts = self.signal_counts.lock().unwrap();
                let entry = counts.entry(symbol.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            let consumer = Arc::clone(self);
            let symbol_for_task = symbol.clone();
            let daily_price_change_pct = daily.price_change_pct_24h;
            let daily_quote_volume = daily.quote_volume_24h;
            let chat_id = settings
                .chat_id
                .expect("settings.is_ready() guarantees chat_id is present");
            let bot_token = settings
                .bot_token
                .clone()
                .expect("settings.is_ready() guarantees bot_token is present");

            tasks.push(tokio::spawn(async move {
                consumer
                    .send_and_enrich(
                        symbol_for_task,
                        multiplier,
                        daily_price_change_pct,
                        daily_quote_volume,
                        count,
                        chat_id,
                        bot_token,
                    )
                    .await
            }));
        }

        let dispatched = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        if dispatched > 0 {
            info!(dispatched, "tick dispatched signals");
        }
    }

    #[instrument(skip(self), fields(signal_id = %Uuid::new_v4()))]
    async fn send_and_enrich(
        &self,
        symbol: String,
        multiplier: f64,
        daily_price_change_pct: f64,
        daily_quote_volume: f64,
        _signal_count: u64,
        chat_id: i64,
        bot_token: String,
    ) {
        let caption = text::create_text(
            &symbol,
            multiplier,
            self.exchange_kind,
            self.market_type,
            daily_price_change_pct,
            daily_quote_volume,
        );

        let message_ref = match self
            .notifier
            .send_text(&bot_token, chat_id, &caption)
            .await
        {
            Ok(Some(message_ref)) => message_ref,
            Ok(None) => {
                warn!(symbol = %symbol, "notifier produced no addressable message, skipping chart enrichment");
                return;
            }
            Err(e) => {
                warn!(symbol = %symbol, error = ?e, "failed to send signal text");
                return;
            }
        };

        let klines = match self
            .client
            .recent_klines(&symbol, KlineInterval::Min5, CHART_CONTEXT_CANDLES)
            .await
        {
            Ok(klines) => klines,
            Err(e) => {
                warn!(symbol = %symbol, error = ?e, "failed to fetch chart-context klines");
                return;
            }
        };

        if klines.is_empty() {
            warn!(symbol = %symbol, "no chart-context klines returned, skipping chart enrichment");
            return;
        }

        let start_price = klines.first().map(|k| k.open).unwrap_or_default();
        let final_price = klines.last().map(|k| k.close).unwrap_or_default();
        let symbol_for_render = symbol.clone();

        let chart_bytes = tokio::task::spawn_blocking(move || {
            chart::render_chart(
                &klines,
                &symbol_for_render,
                start_price,
                final_price,
                daily_price_change_pct,
            )
        })
        .await;

        let chart_bytes = match chart_bytes {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(symbol = %symbol, error = ?e, "chart render failed");
                return;
            }
            Err(e) => {
                warn!(symbol = %symbol, error = ?e, "chart render task panicked");
                return;
            }
        };

        if let Err(e) = self
            .notifier
            .edit_media(&bot_token, chat_id, &message_ref, chart_bytes, &caption)
            .await
        {
            warn!(symbol = %symbol, error = ?e, "failed to attach chart to signal message");
        }
    }
}

/// Ratio of windowed per-second base volume to daily per-second quote
/// volume. Numerator uses candle base volume, denominator uses 24h ticker
/// quote volume — an intentional asymmetry in the reference implementation;
/// `min_multiplier` is calibrated against this exact ratio, not a
/// dimensioned quantity.
fn compute_multiplier(
    buffer: &CandleBuffer,
    daily_quote_volume: f64,
    interval_seconds: i64,
    now: DateTime<Utc>,
) -> f64 {
    if interval_seconds <= 0 || daily_quote_volume <= 0.0 {
        return 0.0;
    }

    let threshold_ms = (now.timestamp_millis()) - interval_seconds * 1000;
    let vol_in_window: f64 = buffer
        .iter()
        .filter(|k| k.open_time_ms > threshold_ms)
        .map(|k| k.base_volume)
        .sum();

    if vol_in_window <= 0.0 {
        return 0.0;
    }

    let vol_per_sec_window = vol_in_window / interval_seconds as f64;
    let vol_per_sec_daily = daily_quote_volume / 86_400.0;
    vol_per_sec_window / vol_per_sec_daily
}
