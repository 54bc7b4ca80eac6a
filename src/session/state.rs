use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    TimedOut(Duration),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
            Outcome::TimedOut(after) => write!(f, "timed out after {} s", after.as_secs()),
        }
    }
}

struct Inner {
    rounds: u32,
    downloads: HashMap<SocketAddr, Vec<Duration>>,
    last_heartbeat: Instant,
    timeout: Option<Duration>,
    done: bool,
    outcome: Option<Outcome>,
}

/// Round and timing accounting shared between a session and its watchdog
pub struct SessionState {
    inner: Mutex<Inner>,
}

impl SessionState {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rounds: 0,
                downloads: HashMap::new(),
                last_heartbeat: Instant::now(),
                timeout,
                done: false,
                outcome: None,
            }),
        }
    }

    pub fn heartbeat(&self) {
        self.inner.lock().last_heartbeat = Instant::now();
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.lock().timeout
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().timeout = timeout;
    }

    /// True once no heartbeat arrived for the whole timeout
    pub fn timed_out(&self) -> bool {
        let inner = self.inner.lock();
        match inner.timeout {
            Some(timeout) => inner.last_heartbeat.elapsed() >= timeout,
            None => false,
        }
    }

    /// Count a finished round, returning the new total
    pub fn new_round(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.rounds += 1;
        inner.rounds
    }

    pub fn rounds(&self) -> u32 {
        self.inner.lock().rounds
    }

    pub fn record_download(&self, address: SocketAddr, elapsed: Duration) {
        self.inner
            .lock()
            .downloads
            .entry(address)
            .or_default()
            .push(elapsed);
    }

    /// Snapshot of the recorded fetch durations
    pub fn downloads(&self) -> HashMap<SocketAddr, Vec<Duration>> {
        self.inner.lock().downloads.clone()
    }

    pub fn mark_done(&self) {
        self.inner.lock().done = true;
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        self.inner.lock().outcome = Some(outcome);
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome.clone()
    }

    /// Await `fetch` and record how long it took under `address`.
    ///
    /// Failed fetches are not recorded.
    pub async fn timed<F, T, E>(&self, address: SocketAddr, fetch: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let value = fetch.await?;
        self.record_download(address, started.elapsed());
        Ok(value)
    }
}
