use std::{
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use market_bar_relay::{
    chart::driver::{ChartDriver, ViewerInput},
    models::LiveBar,
    relay::RelayMessage,
};
use serde_json::json;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod source;
mod view;

#[cfg(test)]
mod tests;

use cli::{parse_args, print_usage, Config, ParseResult};
use source::HttpHistorySource;
use view::{format_bar_line, PrintingConsumer};

const INPUT_QUEUE_CAPACITY: usize = 256;
const SCROLL_BACK_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let parse_result = match parse_args(&args) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("error: {err}\n");
            print_usage();
            std::process::exit(2);
        }
    };

    match parse_result {
        ParseResult::Help => {
            print_usage();
            Ok(())
        }
        ParseResult::Run(config) => {
            init_tracing();
            run_chart(config).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run_chart(config: Config) -> anyhow::Result<()> {
    let ws_url = config.relay_ws_endpoint();
    println!(
        "symbol={} kind={} timeframe={} relay={} http={}",
        config.symbol, config.kind, config.timeframe, ws_url, config.http_url
    );
    if let Some(duration_secs) = config.duration_secs {
        println!("will stop after {duration_secs}s");
    }
    println!("press Ctrl+C to stop\n");

    let (stream, _) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect websocket {ws_url}"))?;
    let (mut ws_sender, mut ws_receiver) = stream.split();

    let source = HttpHistorySource::new(&config.http_url, Duration::from_secs(config.timeout_secs))
        .context("failed to build history client")?;
    let label = format!("{}:{} {}", config.kind, config.symbol.to_ascii_uppercase(), config.timeframe);
    let driver = ChartDriver::new(PrintingConsumer::new(label), Arc::new(source));

    let (input_sender, input_receiver) = mpsc::channel::<ViewerInput>(INPUT_QUEUE_CAPACITY);
    let driver_task = tokio::spawn(driver.run(input_receiver));

    input_sender
        .send(ViewerInput::Select {
            symbol: config.symbol.clone(),
            kind: config.kind,
            timeframe: config.timeframe,
        })
        .await
        .context("chart driver stopped before selection")?;

    let subscribe = json!({
        "op": "subscribe",
        "symbol": config.symbol,
        "kind": config.kind.as_str(),
    });
    ws_sender
        .send(Message::Text(subscribe.to_string().into()))
        .await
        .context("failed to send subscribe command")?;

    let started_at = Instant::now();
    let mut remaining_scrolls = config.scroll_back;
    let mut scroll_tick = tokio::time::interval(SCROLL_BACK_INTERVAL);
    scroll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    scroll_tick.tick().await;

    let mut stop_check = tokio::time::interval(Duration::from_millis(50));
    stop_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
    stop_check.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopped: received Ctrl+C");
                break;
            }
            _ = stop_check.tick() => {
                if should_stop(started_at, &config) {
                    println!("stopped: reached configured duration");
                    break;
                }
            }
            _ = scroll_tick.tick(), if remaining_scrolls > 0 => {
                remaining_scrolls -= 1;
                if input_sender.send(ViewerInput::VisibleRange { from: 0.0 }).await.is_err() {
                    break;
                }
            }
            message = ws_receiver.next() => {
                let Some(message) = message else {
                    println!("stopped: relay closed the websocket");
                    break;
                };

                match message.context("websocket read error")? {
                    Message::Ping(payload) => {
                        ws_sender
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to reply to websocket ping")?;
                    }
                    Message::Close(_) => {
                        println!("stopped: relay closed the websocket");
                        break;
                    }
                    Message::Text(text) => {
                        let Some(input) = handle_relay_text(text.as_str()) else {
                            continue;
                        };
                        if input_sender.send(input).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
    drop(input_sender);

    let manager = driver_task.await.context("chart driver task failed")?;
    if let Some(series) = manager.series() {
        println!(
            "final series: {} bars, limit reached: {}",
            series.bars.len(),
            series.reached_limit
        );
    }

    Ok(())
}

fn handle_relay_text(text: &str) -> Option<ViewerInput> {
    let message = match serde_json::from_str::<RelayMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "unrecognized relay message");
            return None;
        }
    };

    match relay_input(message) {
        Ok(input) => Some(input),
        Err(Some(line)) => {
            println!("{line}");
            None
        }
        Err(None) => None,
    }
}

pub(crate) fn relay_input(message: RelayMessage) -> Result<ViewerInput, Option<String>> {
    match message {
        RelayMessage::Bar {
            symbol,
            kind,
            bar,
            source,
        } => {
            tracing::debug!(line = %format_bar_line("live", &bar), "relay bar");
            Ok(ViewerInput::Live(LiveBar {
                symbol,
                kind,
                bar,
                source,
            }))
        }
        RelayMessage::Connected { message } => Err(Some(format!("relay: {message}"))),
        RelayMessage::Error { message } => Err(Some(format!("relay error: {message}"))),
        RelayMessage::Subscribed { symbol, kind } => {
            Err(Some(format!("subscribed to live {kind}:{symbol}")))
        }
        RelayMessage::Unsubscribed { symbol, kind } => {
            Err(Some(format!("unsubscribed from live {kind}:{symbol}")))
        }
        RelayMessage::Pong => Err(None),
    }
}

fn should_stop(started_at: Instant, config: &Config) -> bool {
    config
        .duration_secs
        .is_some_and(|duration_secs| started_at.elapsed() >= Duration::from_secs(duration_secs))
}
