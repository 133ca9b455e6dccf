pub mod driver;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    history::{HistoryFetchError, HistoryQuery},
    models::{normalize_series, AssetKind, Bar, BarSource, LiveBar, Timeframe},
    normalize::display_to_utc,
};

pub const BACKFILL_EDGE_THRESHOLD: f64 = 3.0;
pub const MIN_BARS_FOR_BACKFILL: usize = 50;
pub const BACKFILL_DEBOUNCE: Duration = Duration::from_millis(500);

pub trait ChartConsumer {
    fn on_series_replaced(&mut self, bars: &[Bar]);
    fn on_series_appended(&mut self, bar: &Bar);
    fn on_limit_reached(&mut self, message: &str);
    fn on_backfill_started(&mut self);
    fn on_backfill_finished(&mut self);
    fn on_fetch_failed(&mut self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesPhase {
    Empty,
    Loading,
    Ready,
    BackfillLoading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPurpose {
    Initial,
    Backfill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub generation: u64,
    pub purpose: FetchPurpose,
    pub query: HistoryQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesState {
    pub symbol: String,
    pub kind: AssetKind,
    pub timeframe: Timeframe,
    pub bars: Vec<Bar>,
    pub earliest_loaded_time: Option<i64>,
    pub reached_limit: bool,
}

impl SeriesState {
    fn new(symbol: &str, kind: AssetKind, timeframe: Timeframe) -> Self {
        Self {
            symbol: crate::models::normalize_symbol(symbol),
            kind,
            timeframe,
            bars: Vec::new(),
            earliest_loaded_time: None,
            reached_limit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Installed { bars: usize },
    Merged { added: usize },
    LimitReached,
    Failed,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Appended,
    Updated,
    Discarded,
}

pub struct ChartDataManager<C> {
    consumer: C,
    series: Option<SeriesState>,
    phase: SeriesPhase,
    generation: u64,
    pending_trigger: Option<(Instant, f64)>,
}

impl<C: ChartConsumer> ChartDataManager<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            series: None,
            phase: SeriesPhase::Empty,
            generation: 0,
            pending_trigger: None,
        }
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn into_consumer(self) -> C {
        self.consumer
    }

    pub fn series(&self) -> Option<&SeriesState> {
        self.series.as_ref()
    }

    pub fn phase(&self) -> SeriesPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a new series. The previous series is dropped and the display
    /// cleared before the initial load is requested; any ticket issued
    /// before this call becomes stale.
    pub fn select(
        &mut self,
        symbol: &str,
        kind: AssetKind,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> HistoryTicket {
        self.generation += 1;
        let series = SeriesState::new(symbol, kind, timeframe);
        let query = HistoryQuery::default_window(&series.symbol, kind, timeframe, now);

        tracing::debug!(
            symbol = %series.symbol,
            kind = %kind,
            timeframe = %timeframe,
            generation = self.generation,
            "series selected"
        );
        self.series = Some(series);
        self.phase = SeriesPhase::Loading;
        self.pending_trigger = None;
        self.consumer.on_series_replaced(&[]);

        HistoryTicket {
            generation: self.generation,
            purpose: FetchPurpose::Initial,
            query,
        }
    }

    pub fn set_timeframe(&mut self, timeframe: Timeframe, now: DateTime<Utc>) -> Option<HistoryTicket> {
        let (symbol, kind) = {
            let series = self.series.as_ref()?;
            (series.symbol.clone(), series.kind)
        };
        Some(self.select(&symbol, kind, timeframe, now))
    }

    pub fn note_visible_range(&mut self, from: f64, now: Instant) {
        self.pending_trigger = Some((now + BACKFILL_DEBOUNCE, from));
    }

    pub fn next_backfill_deadline(&self) -> Option<Instant> {
        self.pending_trigger.map(|(deadline, _)| deadline)
    }

    pub fn poll_backfill(&mut self, now: Instant) -> Option<HistoryTicket> {
        let (deadline, from) = self.pending_trigger?;
        if now < deadline {
            return None;
        }
        self.pending_trigger = None;

        if from > BACKFILL_EDGE_THRESHOLD || self.phase != SeriesPhase::Ready {
            return None;
        }
        let series = self.series.as_ref()?;
        if series.reached_limit || series.bars.len() <= MIN_BARS_FOR_BACKFILL {
            return None;
        }

        let earliest = series.earliest_loaded_time?;
        let query = HistoryQuery::before(&series.symbol, series.kind, series.timeframe, earliest)?;

        tracing::debug!(symbol = %series.symbol, earliest, "requesting backfill");
        self.phase = SeriesPhase::BackfillLoading;
        self.consumer.on_backfill_started();

        Some(HistoryTicket {
            generation: self.generation,
            purpose: FetchPurpose::Backfill,
            query,
        })
    }

    pub fn apply_history(
        &mut self,
        ticket: HistoryTicket,
        result: Result<Vec<Bar>, HistoryFetchError>,
        now: DateTime<Utc>,
    ) -> HistoryOutcome {
        if ticket.generation != self.generation || self.series.is_none() {
            tracing::debug!(
                ticket_generation = ticket.generation,
                generation = self.generation,
                "discarding stale history response"
            );
            return HistoryOutcome::Stale;
        }

        match ticket.purpose {
            FetchPurpose::Initial => self.install_initial(result),
            FetchPurpose::Backfill => {
                self.consumer.on_backfill_finished();
                self.merge_backfill(result, now)
            }
        }
    }

    fn install_initial(&mut self, result: Result<Vec<Bar>, HistoryFetchError>) -> HistoryOutcome {
        self.phase = SeriesPhase::Ready;
        let Some(series) = self.series.as_mut() else {
            return HistoryOutcome::Stale;
        };

        match result {
            Ok(mut bars) => {
                normalize_series(&mut bars);
                series.earliest_loaded_time = bars.first().map(|bar| bar.time);
                series.bars = bars;
                self.consumer.on_series_replaced(&series.bars);
                HistoryOutcome::Installed {
                    bars: series.bars.len(),
                }
            }
            Err(err) => {
                tracing::warn!(symbol = %series.symbol, error = %err, "initial history load failed");
                self.consumer
                    .on_fetch_failed(&format!("Failed to load chart data: {err}"));
                HistoryOutcome::Failed
            }
        }
    }

    fn merge_backfill(
        &mut self,
        result: Result<Vec<Bar>, HistoryFetchError>,
        now: DateTime<Utc>,
    ) -> HistoryOutcome {
        self.phase = SeriesPhase::Ready;
        let Some(series) = self.series.as_mut() else {
            return HistoryOutcome::Stale;
        };

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(symbol = %series.symbol, error = %err, "backfill failed");
                self.consumer
                    .on_fetch_failed(&format!("Failed to load older data: {err}"));
                return HistoryOutcome::Failed;
            }
        };

        let added = match series.earliest_loaded_time {
            Some(earliest) => page.iter().filter(|bar| bar.time < earliest).count(),
            None => page.len(),
        };

        if added == 0 {
            series.reached_limit = true;
            let message = limit_message(series.earliest_loaded_time, now);
            tracing::info!(symbol = %series.symbol, timeframe = %series.timeframe, "history limit reached");
            self.consumer.on_limit_reached(&message);
            return HistoryOutcome::LimitReached;
        }

        let mut merged = Vec::with_capacity(series.bars.len() + page.len());
        merged.extend_from_slice(&series.bars);
        merged.extend(page);
        normalize_series(&mut merged);

        series.earliest_loaded_time = merged.first().map(|bar| bar.time);
        series.bars = merged;
        self.consumer.on_series_replaced(&series.bars);
        HistoryOutcome::Merged { added }
    }

    pub fn apply_live_bar(&mut self, live: &LiveBar) -> LiveOutcome {
        if self.phase == SeriesPhase::Empty || self.phase == SeriesPhase::Loading {
            return LiveOutcome::Discarded;
        }
        let Some(series) = self.series.as_mut() else {
            return LiveOutcome::Discarded;
        };
        if series.symbol != live.symbol || series.kind != live.kind {
            return LiveOutcome::Discarded;
        }
        if !series.timeframe.is_live_granularity() {
            return LiveOutcome::Discarded;
        }

        let outcome = match series.bars.last_mut() {
            Some(last) if live.bar.time == last.time => {
                match live.source {
                    BarSource::Trade => last.absorb(&live.bar),
                    BarSource::Bar => *last = live.bar,
                }
                LiveOutcome::Updated
            }
            Some(last) if live.bar.time < last.time => return LiveOutcome::Discarded,
            _ => {
                series.bars.push(live.bar);
                if series.earliest_loaded_time.is_none() {
                    series.earliest_loaded_time = Some(live.bar.time);
                }
                LiveOutcome::Appended
            }
        };

        if let Some(last) = series.bars.last() {
            self.consumer.on_series_appended(last);
        }
        outcome
    }
}

const SECONDS_PER_YEAR: f64 = 365.0 * 86_400.0;

pub fn limit_message(earliest_display_time: Option<i64>, now: DateTime<Utc>) -> String {
    let Some(earliest) = earliest_display_time.and_then(display_to_utc) else {
        return "Data limit reached. No earlier data is available.".to_string();
    };

    let date = earliest.format("%b %-d, %Y");
    let years = ((now - earliest).num_seconds() as f64 / SECONDS_PER_YEAR).round() as i64;
    match years {
        0 => format!("Data limit reached. Earliest available: {date}"),
        1 => format!("Data limit reached. Earliest available: {date} (1 year ago)"),
        years => format!("Data limit reached. Earliest available: {date} ({years} years ago)"),
    }
}
