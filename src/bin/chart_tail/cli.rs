use market_bar_relay::models::{AssetKind, Timeframe};

pub(crate) const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub(crate) const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_SYMBOL: &str = "AAPL";
const DEFAULT_TIMEOUT_SECS: u64 = 20;

const USAGE: &str = r#"Usage:
  cargo run --bin chart-tail -- [options]

Options:
  --relay <url>            Relay websocket base URL (default: ws://127.0.0.1:8080)
  --http <url>             Relay HTTP base URL for history (default: http://127.0.0.1:8080)
  --symbol <symbol>        Symbol to chart (default: AAPL)
  --kind <kind>            Asset kind: stock|crypto (default: stock)
  --timeframe <tf>         1Min|5Min|15Min|1Hour|1Day|1Week|1Month (default: 1Min)
  --scroll-back <count>    Simulate this many scroll-to-start gestures to load older bars
  --timeout-secs <secs>    History request timeout (default: 20)
  --duration-secs <secs>   Stop after this duration

Examples:
  cargo run --bin chart-tail -- --symbol MSFT --timeframe 5Min
  cargo run --bin chart-tail -- --symbol BTC/USD --kind crypto --scroll-back 3
"#;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) relay_url: String,
    pub(crate) http_url: String,
    pub(crate) symbol: String,
    pub(crate) kind: AssetKind,
    pub(crate) timeframe: Timeframe,
    pub(crate) scroll_back: u32,
    pub(crate) timeout_secs: u64,
    pub(crate) duration_secs: Option<u64>,
}

impl Config {
    pub(crate) fn relay_ws_endpoint(&self) -> String {
        format!("{}/v1/ws", self.relay_url.trim_end_matches('/'))
    }
}

#[derive(Debug)]
pub(crate) enum ParseResult {
    Help,
    Run(Config),
}

pub(crate) fn print_usage() {
    println!("{USAGE}");
}

pub(crate) fn parse_args(args: &[String]) -> Result<ParseResult, String> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(ParseResult::Help);
    }

    let mut config = Config {
        relay_url: DEFAULT_RELAY_URL.to_string(),
        http_url: DEFAULT_HTTP_URL.to_string(),
        symbol: DEFAULT_SYMBOL.to_string(),
        kind: AssetKind::Stock,
        timeframe: Timeframe::Min1,
        scroll_back: 0,
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        duration_secs: None,
    };

    let mut index = 0usize;
    while index < args.len() {
        let flag = &args[index];
        let value = |i: &mut usize| -> Result<String, String> {
            let next = *i + 1;
            if next >= args.len() {
                return Err(format!("missing value for `{flag}`"));
            }
            *i = next;
            Ok(args[*i].clone())
        };

        match flag.as_str() {
            "--relay" => {
                config.relay_url = value(&mut index)?;
            }
            "--http" => {
                config.http_url = value(&mut index)?;
            }
            "--symbol" => {
                config.symbol = value(&mut index)?;
            }
            "--kind" | "--type" => {
                config.kind = AssetKind::parse(&value(&mut index)?)?;
            }
            "--timeframe" => {
                config.timeframe = Timeframe::parse(&value(&mut index)?)?;
            }
            "--scroll-back" => {
                let raw = value(&mut index)?;
                config.scroll_back = raw
                    .parse::<u32>()
                    .map_err(|_| "`--scroll-back` expects a non-negative integer".to_string())?;
            }
            "--timeout-secs" => {
                config.timeout_secs = parse_u64_gt_zero("--timeout-secs", &value(&mut index)?)?;
            }
            "--duration-secs" => {
                config.duration_secs =
                    Some(parse_u64_gt_zero("--duration-secs", &value(&mut index)?)?);
            }
            _ => {
                return Err(format!("unknown argument `{flag}`"));
            }
        }

        index += 1;
    }

    if !config.relay_url.starts_with("ws://") && !config.relay_url.starts_with("wss://") {
        return Err("`--relay` must be a ws:// or wss:// URL".to_string());
    }
    if !config.http_url.starts_with("http://") && !config.http_url.starts_with("https://") {
        return Err("`--http` must be an http:// or https:// URL".to_string());
    }
    if config.symbol.trim().is_empty() {
        return Err("`--symbol` cannot be empty".to_string());
    }

    Ok(ParseResult::Run(config))
}

fn parse_u64_gt_zero(field: &str, value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|_| format!("`{field}` expects a positive integer"))?;
    if parsed == 0 {
        return Err(format!("`{field}` must be greater than 0"));
    }
    Ok(parsed)
}
