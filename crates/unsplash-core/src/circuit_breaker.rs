use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Runtime circuit state shared by every call through one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Rolling-window thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure share in the sampling window at which the circuit opens.
    pub failure_ratio: f64,
    pub sampling_duration: Duration,
    /// Samples required in the window before the ratio is considered.
    pub minimum_throughput: u32,
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_duration: Duration::from_secs(30),
            minimum_throughput: 5,
            break_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    failed: bool,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    samples: VecDeque<Sample>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            samples: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl CircuitInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(sample) = self.samples.front() {
            if now.saturating_duration_since(sample.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.samples.clear();
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trial_in_flight = false;
        self.samples.clear();
    }
}

/// Thread-safe failure-ratio circuit breaker.
///
/// Closed → Open when, within `sampling_duration`, at least `minimum_throughput`
/// outcomes were recorded and the failure share reached `failure_ratio`.
/// Open → HalfOpen once `break_duration` has elapsed; exactly one trial call is
/// admitted, and its outcome commits the breaker to Closed or back to Open.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks for permission to run one call.
    ///
    /// Returns a permit that must be settled with the call's outcome, or the
    /// time left before the breaker will admit a trial.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, Duration> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, false)),
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(CircuitPermit::new(self, true))
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed())
                    .unwrap_or(self.config.break_duration);

                if elapsed >= self.config.break_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.trial_in_flight = true;
                    Ok(CircuitPermit::new(self, true))
                } else {
                    Err(self.config.break_duration - elapsed)
                }
            }
        }
    }

    fn settle(&self, trial: bool, failed: bool) -> Option<CircuitState> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                if failed {
                    inner.open(now);
                    Some(CircuitState::Open)
                } else {
                    inner.close();
                    Some(CircuitState::Closed)
                }
            }
            // Calls admitted before the circuit opened do not speak for the trial.
            CircuitState::HalfOpen | CircuitState::Open => None,
            CircuitState::Closed => {
                inner.samples.push_back(Sample { at: now, failed });
                inner.prune(now, self.config.sampling_duration);
                if !failed {
                    return None;
                }

                let total = inner.samples.len();
                let failures = inner.samples.iter().filter(|sample| sample.failed).count();
                let ratio = failures as f64 / total as f64;

                if total >= self.config.minimum_throughput as usize
                    && ratio >= self.config.failure_ratio
                {
                    inner.open(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.state
    }

    /// Outcomes currently inside the sampling window.
    pub fn sample_count(&self) -> usize {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        inner.prune(Instant::now(), self.config.sampling_duration);
        inner.samples.len()
    }
}

/// Admission to run one call through a [`CircuitBreaker`].
///
/// Settle it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A half-open trial permit that is
/// dropped unsettled, because the call was cancelled or its future abandoned,
/// hands the trial slot to the next caller.
#[derive(Debug)]
#[must_use = "an unsettled permit records nothing"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this call is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a healthy outcome. Returns the new state when this caused a transition.
    pub fn record_success(mut self) -> Option<CircuitState> {
        self.settled = true;
        self.breaker.settle(self.trial, false)
    }

    /// Records a failed outcome. Returns the new state when this caused a transition.
    pub fn record_failure(mut self) -> Option<CircuitState> {
        self.settled = true;
        self.breaker.settle(self.trial, true)
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}
