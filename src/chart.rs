use error_stack::{Report, ResultExt};
use plotters::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::ChartError;
use crate::model::Candle;

const CHART_WIDTH: u32 = 1500;
const CHART_HEIGHT: u32 = 750;
const MOVING_AVERAGE_WINDOW: usize = 20;
const BACKGROUND: RGBColor = RGBColor(0x28, 0x2D, 0x38);
const UP_COLOR: RGBColor = RGBColor(0x0C, 0x96, 0x7F);
const DOWN_COLOR: RGBColor = RGBColor(0xF2, 0x36, 0x45);
const MA_COLOR: RGBColor = RGBColor(0xF5, 0xC5, 0x18);
const TEXT_COLOR: RGBColor = RGBColor(0xFF, 0xFF, 0xFF);

/// Render a dark-themed candlestick + volume + 20-period moving average
/// chart as PNG bytes. Pure function of its inputs: no I/O, safe to run on
/// a blocking worker off the evaluator's hot path.
pub fn render_chart(
    candles: &[Candle],
    symbol: &str,
    start_price: f64,
    final_price: f64,
    pct_change: f64,
) -> Result<Vec<u8>, Report<ChartError>> {
    if candles.is_empty() {
        return Err(Report::new(ChartError::Render {
            symbol: symbol.to_owned(),
        })
        .attach("no candles to render"));
    }

    let mut buffer = vec![0u8; (CHART_WIDTH * CHART_HEIGHT * 3) as usize];

    {
        let root = BitMapBackend::with_buffer(&mut buffer, (CHART_WIDTH, CHART_HEIGHT))
            .into_drawing_area();
        root.fill(&BACKGROUND)
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        let (price_area, volume_area) = root.split_vertically((CHART_HEIGHT * 7) / 10);

        let price_min = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let price_max = candles
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max);
        let price_pad = (price_max - price_min).max(price_max.abs() * 1e-9) * 0.05;

        let x_range = 0f64..candles.len() as f64;

        let title = format!("{symbol} | {start_price}$ -> {final_price}$ | {pct_change:.2}%");

        let mut price_chart = ChartBuilder::on(&price_area)
            .caption(title, ("sans-serif", 26).into_font().color(&TEXT_COLOR))
            .margin(10)
            .x_label_area_size(0)
            .y_label_area_size(90)
            .build_cartesian_2d(
                x_range.clone(),
                (price_min - price_pad)..(price_max + price_pad),
            )
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        price_chart
            .configure_mesh()
            .disable_x_mesh()
            .light_line_style(BACKGROUND.mix(0.3))
            .axis_style(TEXT_COLOR)
            .label_style(("sans-serif", 16).into_font().color(&TEXT_COLOR))
            .y_label_formatter(&|y: &f64| format_price(*y, 2))
            .draw()
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        price_chart
            .draw_series(candles.iter().enumerate().map(|(i, c)| {
                let x = i as f64;
                let color = if c.close >= c.open { UP_COLOR } else { DOWN_COLOR };
                CandleStick::new(x, c.open, c.high, c.low, c.close, color.filled(), color, 6)
            }))
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        if candles.len() >= MOVING_AVERAGE_WINDOW {
            let ma_series: Vec<(f64, f64)> = moving_average(candles, MOVING_AVERAGE_WINDOW);
            price_chart
                .draw_series(LineSeries::new(ma_series, MA_COLOR.stroke_width(2)))
                .change_context(ChartError::Render {
                    symbol: symbol.to_owned(),
                })?;
        }

        let volume_max = candles
            .iter()
            .map(|c| c.base_volume)
            .fold(0f64, f64::max)
            .max(1.0);

        let mut volume_chart = ChartBuilder::on(&volume_area)
            .margin(10)
            .x_label_area_size(0)
            .y_label_area_size(90)
            .build_cartesian_2d(x_range, 0f64..volume_max)
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        volume_chart
            .configure_mesh()
            .disable_x_mesh()
            .light_line_style(BACKGROUND.mix(0.3))
            .axis_style(TEXT_COLOR)
            .label_style(("sans-serif", 14).into_font().color(&TEXT_COLOR))
            .draw()
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        volume_chart
            .draw_series(candles.iter().enumerate().map(|(i, c)| {
                let x = i as f64;
                let color = if c.close >= c.open { UP_COLOR } else { DOWN_COLOR };
                Rectangle::new([(x - 0.3, 0.0), (x + 0.3, c.base_volume)], color.filled())
            }))
            .change_context(ChartError::Render {
                symbol: symbol.to_owned(),
            })?;

        root.present().change_context(ChartError::Render {
            symbol: symbol.to_owned(),
        })?;
    }

    encode_png(&buffer, symbol)
}

fn moving_average(candles: &[Candle], window: usize) -> Vec<(f64, f64)> {
    let mut out = Vec::with_capacity(candles.len().saturating_sub(window) + 1);
    let mut sum = 0f64;
    for (i, c) in candles.iter().enumerate() {
        sum += c.close;
        if i >= window {
            sum -= candles[i - window].close;
        }
        if i + 1 >= window {
            out.push((i as f64, sum / window as f64));
        }
    }
    out
}

fn encode_png(rgb_buffer: &[u8], symbol: &str) -> Result<Vec<u8>, Report<ChartError>> {
    let image: image::RgbImage =
        image::ImageBuffer::from_raw(CHART_WIDTH, CHART_HEIGHT, rgb_buffer.to_vec()).ok_or_else(
            || {
                Report::new(ChartError::Encode {
                    symbol: symbol.to_owned(),
                })
            },
        )?;

    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .change_context(ChartError::Encode {
            symbol: symbol.to_owned(),
        })?;

    Ok(out)
}

fn split_plain(plain: &str) -> (&str, &str) {
    match plain.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (plain, ""),
    }
}

fn to_decimal(value: f64) -> Decimal {
    if value == 0.0 {
        return Decimal::ZERO;
    }
    let formatted = format!("{value:.14e}");
    Decimal::from_scientific(&formatted).unwrap_or(Decimal::ZERO)
}

/// Smooths the float-conversion tail noise in the fractional part, e.g.
/// `0.00240000000000000000001 -> 0.0024`.
fn cleanup_decimal_noise(value: Decimal, significant_digits: usize) -> Decimal {
    if value.is_zero() {
        return value;
    }

    let negative = value.is_sign_negative();
    let abs_value = value.abs();
    let plain = abs_value.to_string();
    let (_, frac_part) = split_plain(&plain);
    let frac_part = frac_part.trim_end_matches('0');

    if frac_part.len() <= 20 {
        return value;
    }

    let first_non_zero = frac_part.len() - frac_part.trim_start_matches('0').len();
    let keep_decimals = (first_non_zero + significant_digits + 4)
        .max(significant_digits + 4)
        .min(28);

    let cleaned =
        abs_value.round_dp_with_strategy(keep_decimals as u32, RoundingStrategy::MidpointAwayFromZero);

    if negative { -cleaned } else { cleaned }
}

/// Formats a price for a chart's Y-axis, compressing many leading fractional
/// zeros into `0.0(N)X` notation where `N` counts the zeros and `X` is
/// `significant_digits` digits starting at the first non-zero one, e.g.
/// `0.00000001234` with `significant_digits = 2` -> `0.0(7)12`.
pub fn format_price(value: f64, significant_digits: usize) -> String {
    assert!(significant_digits >= 1, "significant_digits must be >= 1");

    let dec_value = to_decimal(value);
    if dec_value.is_zero() {
        return "0".to_string();
    }

    let dec_value = cleanup_decimal_noise(dec_value, significant_digits);

    let sign = if dec_value.is_sign_negative() { "-" } else { "" };
    let abs_value = dec_value.abs();

    let plain = abs_value.to_string();
    let (int_part, frac_part) = split_plain(&plain);
    let frac_part = frac_part.trim_end_matches('0');

    if frac_part.is_empty() {
        return format!("{sign}{int_part}");
    }

    let leading_zeros = frac_part.len() - frac_part.trim_start_matches('0').len();
    if leading_zeros < 3 {
        return format!("{sign}{int_part}.{frac_part}");
    }

    let decimal_places = (leading_zeros + significant_digits).min(28);
    let rounded =
        abs_value.round_dp_with_strategy(decimal_places as u32, RoundingStrategy::MidpointAwayFromZero);

    let rounded_plain = rounded.to_string();
    let (_, rounded_frac) = split_plain(&rounded_plain);
    let rounded_frac = rounded_frac.trim_end_matches('0');

    let rounded_zeros = rounded_frac.len() - rounded_frac.trim_start_matches('0').len();
    let significant: String = rounded_frac
        .chars()
        .skip(rounded_zeros)
        .take(significant_digits)
        .collect();
    let significant = significant.trim_end_matches('0');
    let significant = if significant.is_empty() { "0" } else { significant };

    format!("{sign}0.0({rounded_zeros}){significant}")
}
