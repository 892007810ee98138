use crate::model::{ExchangeKind, MarketType};

/// Human-readable volume with K/M/B suffixes, one decimal place.
pub fn human_readable_volume(volume: f64) -> String {
    let abs = volume.abs();
    if abs >= 1_000_000_000.0 {
        format!("{:.1}B", volume / 1_000_000_000.0)
    } else if abs >= 1_000_000.0 {
        format!("{:.1}M", volume / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.1}K", volume / 1_000.0)
    } else {
        format!("{volume:.1}")
    }
}

/// Deep link to the symbol's trading page on the given exchange/market.
pub fn exchange_deep_link(exchange: ExchangeKind, market_type: MarketType, symbol: &str) -> String {
    match (exchange, market_type) {
        (ExchangeKind::Binance, MarketType::Futures) => {
            format!("https://www.binance.com/en/futures/{symbol}")
        }
        (ExchangeKind::Binance, MarketType::Spot) => {
            format!("https://www.binance.com/en/trade/{symbol}")
        }
        (ExchangeKind::Bingx, MarketType::Futures) => {
            format!("https://bingx.com/en/futures/{symbol}")
        }
        (ExchangeKind::Bingx, MarketType::Spot) => {
            format!("https://bingx.com/en/spot/{symbol}")
        }
    }
}

/// Formats the exact Russian-language volume-surge signal message.
pub fn create_text(
    symbol: &str,
    multiplier: f64,
    exchange: ExchangeKind,
    market_type: MarketType,
    daily_price_change_pct: f64,
    daily_quote_volume: f64,
) -> String {
    let direction_emoji = if multiplier >= 1.0 { "🚀" } else { "🔻" };
    let ex_link = exchange_deep_link(exchange, market_type, symbol);

    format!(
        "{direction_emoji} Резкий рост объема: {symbol}\n\n\
         Текущий объем выше среднего в {multiplier:.2}x\n\
         Изменение цены за день: {daily_price_change_pct:.2}%\n\
         Объем за день: {} $\n\n\
         {ex_link}",
        human_readable_volume(daily_quote_volume)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_readable_volume_picks_correct_suffix() {
        assert_eq!(human_readable_volume(500.0), "500.0");
        assert_eq!(human_readable_volume(1_500.0), "1.5K");
        assert_eq!(human_readable_volume(2_300_000.0), "2.3M");
        assert_eq!(human_readable_volume(4_000_000_000.0), "4.0B");
    }

    #[test]
    fn create_text_matches_exact_template() {
        let text = create_text(
            "BTCUSDT",
            75.4321,
            ExchangeKind::Binance,
            MarketType::Futures,
            -3.14159,
            123_456_789.0,
        );
        let expected = "🚀 Резкий рост объема: BTCUSDT\n\n\
            Текущий объем выше среднего в 75.43x\n\
            Изменение цены за день: -3.14%\n\
            Объем за день: 123.5M $\n\n\
            https://www.binance.com/en/futures/BTCUSDT";
        assert_eq!(text, expected);
    }

    #[test]
    fn create_text_uses_down_emoji_below_one() {
        let text = create_text(
            "ETHUSDT",
            0.5,
            ExchangeKind::Binance,
            MarketType::Futures,
            1.0,
            1000.0,
        );
        assert!(text.starts_with("🔻"));
    }
}
