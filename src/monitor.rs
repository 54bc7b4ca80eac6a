//! Watchdog that drives a session, enforces its timeout and reports fetch latencies.

use crate::session::{Outcome, Session};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const PERCENTILES: [f64; 9] = [0.01, 0.05, 0.10, 0.25, 0.50, 0.75, 0.90, 0.95, 0.99];

/// Summary of a set of durations, in seconds
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation, undefined for fewer than two samples
    pub std: Option<f64>,
    pub min: f64,
    pub percentiles: Vec<(f64, f64)>,
    pub max: f64,
}

impl Stats {
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = samples.iter().map(Duration::as_secs_f64).collect();
        values.sort_by(|a, b| a.total_cmp(b));

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = (count > 1).then(|| {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            var.sqrt()
        });

        Some(Self {
            count,
            mean,
            std,
            min: values[0],
            percentiles: PERCENTILES
                .iter()
                .map(|&p| (p, percentile(&values, p)))
                .collect(),
            max: values[count - 1],
        })
    }
}

/// Linear interpolation between closest ranks of sorted `values`
fn percentile(values: &[f64], p: f64) -> f64 {
    let rank = p * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    values[lower] + (values[upper] - values[lower]) * weight
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "count {:>12}", self.count)?;
        writeln!(f, "mean  {:>12.6}", self.mean)?;
        match self.std {
            Some(std) => writeln!(f, "std   {:>12.6}", std)?,
            None => writeln!(f, "std   {:>12}", "NaN")?,
        }
        writeln!(f, "min   {:>12.6}", self.min)?;
        for (p, value) in &self.percentiles {
            writeln!(f, "{:<5} {:>12.6}", format!("{}%", p * 100.0), value)?;
        }
        write!(f, "max   {:>12.6}", self.max)
    }
}

/// Fetch statistics overall and per remote address
#[derive(Debug, Clone)]
pub struct Report {
    pub total: Option<Stats>,
    pub per_address: Vec<(SocketAddr, Stats)>,
}

impl Report {
    pub fn from_downloads(downloads: &HashMap<SocketAddr, Vec<Duration>>) -> Self {
        let all: Vec<Duration> = downloads.values().flatten().copied().collect();
        let mut per_address: Vec<(SocketAddr, Stats)> = downloads
            .iter()
            .filter_map(|(addr, samples)| Stats::from_samples(samples).map(|s| (*addr, s)))
            .collect();
        per_address.sort_by_key(|(addr, _)| *addr);
        Self {
            total: Stats::from_samples(&all),
            per_address,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.total {
            Some(total) => writeln!(f, "Total:\n{}", total)?,
            None => writeln!(f, "Total: no downloads")?,
        }
        for (addr, stats) in &self.per_address {
            writeln!(f, "\n{}:\n{}", addr, stats)?;
        }
        Ok(())
    }
}

/// Runs one session to a terminal outcome and always tears it down
pub struct Monitor {
    session: Arc<dyn Session>,
    poll_interval: Duration,
}

impl Monitor {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run(&self) -> Outcome {
        let state = Arc::clone(self.session.state());

        let outcome = match self.session.set_up().await {
            Ok(()) => self.supervise().await,
            Err(e) => {
                error!("Session set-up failed: {}", e);
                Outcome::Failed(e.to_string())
            }
        };

        self.session.tear_down().await;
        match &outcome {
            Outcome::Completed => info!("Test session {}", outcome),
            _ => warn!("Test session {}", outcome),
        }
        info!("Test state result:\n{}", Report::from_downloads(&state.downloads()));
        state.set_outcome(outcome.clone());
        outcome
    }

    async fn supervise(&self) -> Outcome {
        let state = Arc::clone(self.session.state());
        let session = Arc::clone(&self.session);
        let mut task = tokio::spawn(async move { session.run().await });

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let outcome = loop {
            if state.is_done() {
                break Outcome::Completed;
            }
            if state.timed_out() {
                break Outcome::TimedOut(state.timeout().unwrap_or_default());
            }

            tokio::select! {
                joined = &mut task => {
                    break match joined {
                        Ok(Ok(())) if state.is_done() => Outcome::Completed,
                        Ok(Ok(())) => Outcome::Failed("incomplete".to_string()),
                        Ok(Err(e)) => Outcome::Failed(e.to_string()),
                        Err(e) => Outcome::Failed(format!("session task aborted: {}", e)),
                    };
                }
                _ = &mut ctrl_c => {
                    break Outcome::Failed("interrupted".to_string());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };

        if !task.is_finished() {
            task.abort();
        }
        outcome
    }
}
