use chrono::DateTime;
use market_bar_relay::{chart::ChartConsumer, models::Bar};

pub(crate) fn format_display_time(time: i64) -> String {
    DateTime::from_timestamp(time, 0)
        .map(|value| value.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| time.to_string())
}

pub(crate) fn format_bar_line(prefix: &str, bar: &Bar) -> String {
    format!(
        "{prefix} {} o={:.4} h={:.4} l={:.4} c={:.4} v={:.2}",
        format_display_time(bar.time),
        bar.open,
        bar.high,
        bar.low,
        bar.close,
        bar.volume
    )
}

pub(crate) fn format_series_summary(label: &str, bars: &[Bar]) -> String {
    match (bars.first(), bars.last()) {
        (Some(first), Some(last)) => format!(
            "{label}: {} bars from {} to {}",
            bars.len(),
            format_display_time(first.time),
            format_display_time(last.time)
        ),
        _ => format!("{label}: no bars"),
    }
}

pub(crate) struct PrintingConsumer {
    label: String,
    last_time: Option<i64>,
}

impl PrintingConsumer {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_time: None,
        }
    }
}

impl ChartConsumer for PrintingConsumer {
    fn on_series_replaced(&mut self, bars: &[Bar]) {
        self.last_time = bars.last().map(|bar| bar.time);
        println!("{}", format_series_summary(&self.label, bars));
    }

    fn on_series_appended(&mut self, bar: &Bar) {
        let prefix = if self.last_time == Some(bar.time) {
            "update"
        } else {
            "append"
        };
        self.last_time = Some(bar.time);
        println!("{}", format_bar_line(prefix, bar));
    }

    fn on_limit_reached(&mut self, message: &str) {
        println!("{}: {message}", self.label);
    }

    fn on_backfill_started(&mut self) {
        println!("{}: loading older bars", self.label);
    }

    fn on_backfill_finished(&mut self) {
        println!("{}: backfill finished", self.label);
    }

    fn on_fetch_failed(&mut self, message: &str) {
        eprintln!("{}: history request failed: {message}", self.label);
    }
}
