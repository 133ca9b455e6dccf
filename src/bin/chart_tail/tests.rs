use chrono::{TimeZone, Utc};
use market_bar_relay::{
    chart::driver::ViewerInput,
    history::HistoryQuery,
    models::{AssetKind, Bar, BarSource, Timeframe},
    relay::RelayMessage,
};

use super::{
    cli::{parse_args, Config, ParseResult},
    relay_input,
    source::bars_query_params,
    view::{format_bar_line, format_display_time, format_series_summary},
};

fn parse_run(args: &[&str]) -> Config {
    let args = args
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>();
    match parse_args(&args).expect("parse should succeed") {
        ParseResult::Run(config) => config,
        ParseResult::Help => panic!("expected ParseResult::Run"),
    }
}

fn parse_err(args: &[&str]) -> String {
    let args = args
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>();
    match parse_args(&args) {
        Err(err) => err,
        Ok(other) => panic!("expected parse error, got {other:?}"),
    }
}

fn bar(time: i64, close: f64) -> Bar {
    Bar {
        time,
        open: close,
        high: close,
        low: close,
        close,
        volume: 10.0,
    }
}

#[test]
fn parse_args_defaults_to_local_relay() {
    let config = parse_run(&[]);
    assert_eq!(config.relay_ws_endpoint(), "ws://127.0.0.1:8080/v1/ws");
    assert_eq!(config.http_url, "http://127.0.0.1:8080");
    assert_eq!(config.symbol, "AAPL");
    assert_eq!(config.kind, AssetKind::Stock);
    assert_eq!(config.timeframe, Timeframe::Min1);
    assert_eq!(config.scroll_back, 0);
    assert_eq!(config.duration_secs, None);
}

#[test]
fn parse_args_reads_chart_flags() {
    let config = parse_run(&[
        "--relay",
        "ws://10.0.0.5:9000/",
        "--http",
        "http://10.0.0.5:9000",
        "--symbol",
        "BTC/USD",
        "--kind",
        "crypto",
        "--timeframe",
        "15m",
        "--scroll-back",
        "4",
        "--duration-secs",
        "30",
    ]);

    assert_eq!(config.relay_ws_endpoint(), "ws://10.0.0.5:9000/v1/ws");
    assert_eq!(config.symbol, "BTC/USD");
    assert_eq!(config.kind, AssetKind::Crypto);
    assert_eq!(config.timeframe, Timeframe::Min15);
    assert_eq!(config.scroll_back, 4);
    assert_eq!(config.duration_secs, Some(30));
}

#[test]
fn parse_args_help_wins() {
    let args = vec!["--symbol".to_string(), "MSFT".to_string(), "-h".to_string()];
    assert!(matches!(parse_args(&args), Ok(ParseResult::Help)));
}

#[test]
fn parse_args_rejects_bad_values() {
    assert!(parse_err(&["--kind", "forex"]).contains("unsupported kind"));
    assert!(parse_err(&["--timeframe", "2Min"]).contains("unsupported timeframe"));
    assert!(parse_err(&["--relay", "http://127.0.0.1:8080"]).contains("ws://"));
    assert!(parse_err(&["--scroll-back", "-1"]).contains("--scroll-back"));
    assert!(parse_err(&["--duration-secs", "0"]).contains("greater than 0"));
    assert!(parse_err(&["--symbol"]).contains("missing value"));
    assert!(parse_err(&["--symbol", "  "]).contains("cannot be empty"));
    assert!(parse_err(&["--exchange", "binance"]).contains("unknown argument"));
}

#[test]
fn bar_pushes_become_live_input() {
    let message = RelayMessage::Bar {
        symbol: "AAPL".to_string(),
        kind: AssetKind::Stock,
        bar: bar(1_700_000_000, 187.5),
        source: BarSource::Trade,
    };

    match relay_input(message) {
        Ok(ViewerInput::Live(live)) => {
            assert_eq!(live.symbol, "AAPL");
            assert_eq!(live.source, BarSource::Trade);
            assert_eq!(live.bar.close, 187.5);
        }
        other => panic!("expected live input, got {other:?}"),
    }
}

#[test]
fn relay_notices_become_printed_lines() {
    let line = relay_input(RelayMessage::error("Real-time data not available for AAPL"))
        .expect_err("errors are printed");
    assert_eq!(
        line.as_deref(),
        Some("relay error: Real-time data not available for AAPL")
    );

    let line = relay_input(RelayMessage::Subscribed {
        symbol: "ETH/USD".to_string(),
        kind: AssetKind::Crypto,
    })
    .expect_err("acks are printed");
    assert_eq!(line.as_deref(), Some("subscribed to live crypto:ETH/USD"));

    assert!(matches!(relay_input(RelayMessage::Pong), Err(None)));
}

#[test]
fn history_params_use_utc_query_window() {
    let query = HistoryQuery::new(
        "msft",
        AssetKind::Stock,
        Timeframe::Hour1,
        Utc.with_ymd_and_hms(2026, 1, 2, 14, 30, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 1, 5, 21, 0, 0).unwrap(),
    );

    let params = bars_query_params(&query);
    assert_eq!(
        params,
        vec![
            ("symbol", "MSFT".to_string()),
            ("kind", "stock".to_string()),
            ("timeframe", "1Hour".to_string()),
            ("start", "2026-01-02T14:30:00Z".to_string()),
            ("end", "2026-01-05T21:00:00Z".to_string()),
        ]
    );
}

#[test]
fn formats_bars_in_display_time() {
    let time = Utc
        .with_ymd_and_hms(2026, 1, 2, 10, 0, 0)
        .unwrap()
        .timestamp();
    assert_eq!(format_display_time(time), "2026-01-02 10:00");
    assert_eq!(
        format_bar_line("append", &bar(time, 1.25)),
        "append 2026-01-02 10:00 o=1.2500 h=1.2500 l=1.2500 c=1.2500 v=10.00"
    );
}

#[test]
fn summarizes_replaced_series() {
    assert_eq!(format_series_summary("stock:AAPL 1Min", &[]), "stock:AAPL 1Min: no bars");
    assert_eq!(
        format_series_summary("stock:AAPL 1Min", &[bar(0, 1.0), bar(60, 2.0)]),
        "stock:AAPL 1Min: 2 bars from 1970-01-01 00:00 to 1970-01-01 00:01"
    );
}
