use std::sync::Arc;

use chrono::Utc;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};

use crate::{
    history::{HistoryFetchError, HistorySource},
    models::{AssetKind, Bar, LiveBar, Timeframe},
};

use super::{ChartConsumer, ChartDataManager, HistoryTicket};

#[derive(Debug, Clone)]
pub enum ViewerInput {
    Select {
        symbol: String,
        kind: AssetKind,
        timeframe: Timeframe,
    },
    SetTimeframe(Timeframe),
    VisibleRange { from: f64 },
    Live(LiveBar),
}

type FetchResult = (HistoryTicket, Result<Vec<Bar>, HistoryFetchError>);

pub struct ChartDriver<C> {
    manager: ChartDataManager<C>,
    source: Arc<dyn HistorySource>,
}

impl<C: ChartConsumer> ChartDriver<C> {
    pub fn new(consumer: C, source: Arc<dyn HistorySource>) -> Self {
        Self {
            manager: ChartDataManager::new(consumer),
            source,
        }
    }

    pub async fn run(mut self, mut inputs: mpsc::Receiver<ViewerInput>) -> ChartDataManager<C> {
        let (results_sender, mut results) = mpsc::unbounded_channel::<FetchResult>();

        loop {
            let deadline = self.manager.next_backfill_deadline();
            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else {
                        break;
                    };
                    self.handle_input(input, &results_sender);
                }
                Some((ticket, result)) = results.recv() => {
                    let outcome = self.manager.apply_history(ticket, result, Utc::now());
                    tracing::debug!(?outcome, "history response applied");
                }
                _ = wait_for(deadline) => {
                    if let Some(ticket) = self.manager.poll_backfill(Instant::now()) {
                        self.spawn_fetch(ticket, &results_sender);
                    }
                }
            }
        }

        self.manager
    }

    fn handle_input(&mut self, input: ViewerInput, results: &mpsc::UnboundedSender<FetchResult>) {
        match input {
            ViewerInput::Select {
                symbol,
                kind,
                timeframe,
            } => {
                let ticket = self.manager.select(&symbol, kind, timeframe, Utc::now());
                self.spawn_fetch(ticket, results);
            }
            ViewerInput::SetTimeframe(timeframe) => {
                if let Some(ticket) = self.manager.set_timeframe(timeframe, Utc::now()) {
                    self.spawn_fetch(ticket, results);
                }
            }
            ViewerInput::VisibleRange { from } => {
                self.manager.note_visible_range(from, Instant::now());
            }
            ViewerInput::Live(bar) => {
                self.manager.apply_live_bar(&bar);
            }
        }
    }

    fn spawn_fetch(&self, ticket: HistoryTicket, results: &mpsc::UnboundedSender<FetchResult>) {
        let source = self.source.clone();
        let results = results.clone();
        tokio::spawn(async move {
            let result = source.load(&ticket.query).await;
            let _ = results.send((ticket, result));
        });
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
