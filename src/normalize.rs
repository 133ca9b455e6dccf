use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Value};

use crate::models::{normalize_symbol, AssetKind, Bar, BarSource, LiveBar};

/// Bars are stamped in US Eastern standard time regardless of DST.
pub const DISPLAY_UTC_OFFSET_SECS: i64 = -5 * 3600;

const TRADE_BUCKET_SECS: i64 = 60;

pub fn to_display_seconds(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp() + DISPLAY_UTC_OFFSET_SECS
}

pub fn display_to_utc(time: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(time - DISPLAY_UTC_OFFSET_SECS, 0)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Bar(LiveBar),
    Connected,
    Authenticated,
    Error { code: Option<i64>, message: String },
    Subscription,
    Malformed(String),
    Ignored,
}

pub fn parse_stream_frame(payload: &str, kind: AssetKind) -> Result<Vec<StreamMessage>, String> {
    let value = serde_json::from_str::<Value>(payload)
        .map_err(|err| format!("invalid JSON frame: {err}"))?;

    match value {
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| parse_stream_item(item, kind))
            .collect()),
        Value::Object(_) => Ok(vec![parse_stream_item(&value, kind)]),
        other => Err(format!("unexpected frame shape: {other}")),
    }
}

fn parse_stream_item(item: &Value, kind: AssetKind) -> StreamMessage {
    let tag = item.get("T").and_then(Value::as_str).unwrap_or_default();
    match tag {
        "b" | "u" => parse_bar_item(item, kind),
        "t" => parse_trade_item(item, kind),
        "success" => match item.get("msg").and_then(Value::as_str) {
            Some("connected") => StreamMessage::Connected,
            Some("authenticated") => StreamMessage::Authenticated,
            _ => StreamMessage::Ignored,
        },
        "error" => StreamMessage::Error {
            code: item.get("code").and_then(Value::as_i64),
            message: item
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error")
                .to_string(),
        },
        "subscription" => StreamMessage::Subscription,
        _ => StreamMessage::Ignored,
    }
}

fn parse_bar_item(item: &Value, kind: AssetKind) -> StreamMessage {
    let Some(symbol) = item.get("S").and_then(Value::as_str) else {
        return StreamMessage::Malformed("bar without symbol".to_string());
    };
    let Some(timestamp) = item.get("t").and_then(Value::as_str).and_then(parse_rfc3339) else {
        return StreamMessage::Malformed(format!("bar for {symbol} without a valid timestamp"));
    };

    let fields = ["o", "h", "l", "c", "v"].map(|field| item.get(field).and_then(parse_f64_lossy));
    let [Some(open), Some(high), Some(low), Some(close), Some(volume)] = fields else {
        return StreamMessage::Malformed(format!("bar for {symbol} is missing OHLCV fields"));
    };

    StreamMessage::Bar(LiveBar {
        symbol: normalize_symbol(symbol),
        kind,
        bar: Bar {
            time: to_display_seconds(timestamp),
            open,
            high,
            low,
            close,
            volume,
        },
        source: BarSource::Bar,
    })
}

fn parse_trade_item(item: &Value, kind: AssetKind) -> StreamMessage {
    let Some(symbol) = item.get("S").and_then(Value::as_str) else {
        return StreamMessage::Malformed("trade without symbol".to_string());
    };
    let Some(timestamp) = item.get("t").and_then(Value::as_str).and_then(parse_rfc3339) else {
        return StreamMessage::Malformed(format!("trade for {symbol} without a valid timestamp"));
    };
    let Some(price) = item.get("p").and_then(parse_f64_lossy) else {
        return StreamMessage::Malformed(format!("trade for {symbol} without a price"));
    };
    let size = item.get("s").and_then(parse_f64_lossy).unwrap_or_default();

    let bucket = timestamp.timestamp().div_euclid(TRADE_BUCKET_SECS) * TRADE_BUCKET_SECS;
    StreamMessage::Bar(LiveBar {
        symbol: normalize_symbol(symbol),
        kind,
        bar: Bar {
            time: bucket + DISPLAY_UTC_OFFSET_SECS,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
        },
        source: BarSource::Trade,
    })
}

pub fn auth_message(key: &str, secret: &str) -> String {
    json!({ "action": "auth", "key": key, "secret": secret }).to_string()
}

pub fn subscription_message(action: &str, kind: AssetKind, symbols: &[String]) -> String {
    match kind {
        AssetKind::Stock => json!({ "action": action, "trades": symbols, "bars": symbols }),
        AssetKind::Crypto => json!({ "action": action, "bars": symbols }),
    }
    .to_string()
}

pub fn parse_f64_lossy(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse::<f64>().ok()))
        .filter(|numeric| numeric.is_finite())
}

pub fn parse_history_bar(row: &Value) -> Option<Bar> {
    let timestamp = row.get("t").and_then(Value::as_str).and_then(parse_rfc3339)?;
    Some(Bar {
        time: to_display_seconds(timestamp),
        open: row.get("o").and_then(parse_f64_lossy)?,
        high: row.get("h").and_then(parse_f64_lossy)?,
        low: row.get("l").and_then(parse_f64_lossy)?,
        close: row.get("c").and_then(parse_f64_lossy)?,
        volume: row.get("v").and_then(parse_f64_lossy).unwrap_or_default(),
    })
}

pub fn window_before(
    earliest_display_time: i64,
    lookback: TimeDelta,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = display_to_utc(earliest_display_time)? - TimeDelta::seconds(1);
    Some((end - lookback, end))
}
