use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::consumer::Consumer;
use crate::exchange::ExchangeClient;
use crate::model::{ExchangeKind, MarketType};
use crate::notifier::Notifier;
use crate::producer::Producer;
use crate::settings_store::SettingsStore;

const SETTINGS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum ScreenerError {
    #[display("producer failed")]
    Producer,
    #[display("consumer failed")]
    Consumer,
    #[display("could not read initial settings")]
    Settings,
}

/// Lifecycle glue: owns one Producer and one Consumer, binds them, and
/// pushes hot-reloaded settings into the Consumer on a fixed cadence.
pub struct Screener {
    producer: Arc<Producer>,
    consumer: Arc<Consumer>,
    settings_store: Arc<dyn SettingsStore>,
    cancel: CancellationToken,
}

impl Screener {
    pub async fn bootstrap(
        client: Arc<dyn ExchangeClient>,
        notifier: Arc<dyn Notifier>,
        settings_store: Arc<dyn SettingsStore>,
        exchange_kind: ExchangeKind,
        market_type: MarketType,
    ) -> Result<Self, Report<ScreenerError>> {
        settings_store
            .create_if_absent()
            .await
            .change_context(ScreenerError::Settings)?;

        let initial_settings = settings_store
            .get()
            .await
            .change_context(ScreenerError::Settings)?;

        let producer = Arc::new(Producer::new(
            Arc::clone(&client),
            exchange_kind,
            market_type,
        ));
        let consumer = Arc::new(Consumer::new(
            Arc::clone(&producer),
            client,
            notifier,
            exchange_kind,
            market_type,
            initial_settings,
        ));

        Ok(Self {
            producer,
            consumer,
            settings_store,
            cancel: CancellationToken::new(),
        })
    }

    /// Launch Producer, Consumer, and the settings-refresh loop, and wait
    /// on all three until `stop` is called.
    pub async fn run(&self) -> Result<(), Report<ScreenerError>> {
        let producer_task = tokio::spawn({
            let producer = Arc::clone(&self.producer);
            async move { producer.run().await }
        });
        let consumer_task = tokio::spawn({
            let consumer = Arc::clone(&self.consumer);
            async move { consumer.run().await }
        });
        let settings_task = tokio::spawn({
            let consumer = Arc::clone(&self.consumer);
            let settings_store = Arc::clone(&self.settings_store);
            let cancel = self.cancel.clone();
            async move { settings_refresh_loop(consumer, settings_store, cancel).await }
        });

        let (producer_result, consumer_result, _) =
            tokio::join!(producer_task, consumer_task, settings_task);

        producer_result
            .change_context(ScreenerError::Producer)?
            .change_context(ScreenerError::Producer)?;
        consumer_result
            .change_context(ScreenerError::Consumer)?
            .change_context(ScreenerError::Consumer)?;

        Ok(())
    }

    /// Idempotent: stops Consumer, stops Producer, cancels the
    /// settings-refresh loop.
    pub fn stop(&self) {
        self.consumer.stop();
        self.producer.stop();
        self.cancel.cancel();
    }
}

async fn settings_refresh_loop(
    consumer: Arc<Consumer>,
    settings_store: Arc<dyn SettingsStore>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SETTINGS_REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match settings_store.get().await {
                    Ok(settings) => consumer.update_settings(settings),
                    Err(e) => {
                        warn!(error = ?e, "settings refresh failed, keeping last-good settings");
                    }
                }
            }
        }
    }
    info!("settings-refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExchangeError, NotifierError};
    use crate::model::{Candle, KlineInterval, Settings, TickerDaily};
    use futures::future::BoxFuture;
    use std::collections::HashMap;

    struct FakeExchangeClient;

    impl ExchangeClient for FakeExchangeClient {
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
            symbols: Vec<String>,
            _callback: crate::exchange::TradeCallback,
            cancel: CancellationToken,
        ) -> Box<dyn crate::exchange::StreamHandle> {
            Box::new(ImmediatelyIdleStream { symbols, cancel })
        }
    }

    /// A shard that connects, does nothing, and exits as soon as it is
    /// cancelled — enough to exercise `Producer::startup`/shutdown without
    /// a real WebSocket.
    struct ImmediatelyIdleStream {
        #[allow(dead_code)]
        symbols: Vec<String>,
        cancel: CancellationToken,
    }

    impl crate::exchange::StreamHandle for ImmediatelyIdleStream {
        fn start(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
            Box::pin(async move {
                self.cancel.cancelled().await;
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
            !self.cancel.is_cancelled()
        }
    }

    struct FakeNotifier;

    impl Notifier for FakeNotifier {
        fn send_text<'a>(
            &'a self,
            _token: &'a str,
            _chat_id: i64,
            _text: &'a str,
        ) -> BoxFuture<'a, Result<Option<crate::notifier::MessageRef>, Report<NotifierError>>>
        {
            Box::pin(async { Ok(None) })
        }

        fn edit_media<'a>(
            &'a self,
            _token: &'a str,
            _chat_id: i64,
            _message_ref: &'a crate::notifier::MessageRef,
            _photo_bytes: Vec<u8>,
            _caption: &'a str,
        ) -> BoxFuture<'a, Result<(), Report<NotifierError>>> {
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), Report<NotifierError>>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct FakeSettingsStore {
        settings: std::sync::Mutex<Settings>,
    }

    impl SettingsStore for FakeSettingsStore {
        fn get(&self) -> BoxFuture<'_, Result<Settings, Report<crate::error::SettingsError>>> {
            Box::pin(async move { Ok(self.settings.lock().unwrap().clone()) })
        }

        fn create_if_absent(
            &self,
        ) -> BoxFuture<'_, Result<(), Report<crate::error::SettingsError>>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn settings() -> Settings {
        Settings {
            id: 1,
            interval_seconds: 60,
            min_multiplier: 50.0,
            timeout_seconds: 60,
            chat_id: None,
            bot_token: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_producer_and_consumer_from_initial_settings() {
        let screener = Screener::bootstrap(
            Arc::new(FakeExchangeClient),
            Arc::new(FakeNotifier),
            Arc::new(FakeSettingsStore {
                settings: std::sync::Mutex::new(settings()),
            }),
            ExchangeKind::Binance,
            MarketType::Futures,
        )
        .await
        .unwrap();

        // run()/stop() are idempotent and the whole pipeline shuts down
        // promptly once stop() is called, even mid-startup.
        let screener = Arc::new(screener);
        let runner = Arc::clone(&screener);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        screener.stop();
        screener.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("screener did not shut down promptly")
            .expect("screener task panicked");
        assert!(result.is_ok());
    }
}
