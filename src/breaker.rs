use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::CallError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Rolling counts for the current generation. The generation advances on
/// every state transition and on a Closed-interval rollover; counts always
/// restart at zero when it does.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

pub struct BreakerSettings {
    pub name: String,
    /// Trial calls admitted while half-open before the next state is decided.
    pub max_requests: u32,
    /// Optional rollover of the counting window while closed.
    pub interval: Option<Duration>,
    /// How long the breaker stays open before probing again.
    pub cooldown: Duration,
    /// Minimum attempts in the current generation before a trip is possible.
    pub min_requests: u32,
    /// Failure ratio (failures / attempts) at which the breaker trips.
    pub failure_ratio: f64,
}

impl Default for BreakerSettings {
    fn default() -> BreakerSettings {
        BreakerSettings {
            name: "circuit-breaker".to_string(),
            max_requests: 3,
            interval: None,
            cooldown: Duration::from_secs(4),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Failure-rate gate around any zero-argument callable operation.
///
/// One breaker is shared by every caller of the operation it guards; the
/// state and counters live behind a mutex and every transition is reported
/// through `tracing`. Outcomes are recorded against the generation that
/// admitted the call, so a completion that straddles a transition is ignored
/// rather than corrupting the new window's counts.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> CircuitBreaker {
        // The first Closed window must arm the interval too, or the initial
        // generation would never roll over.
        let expiry = settings.interval.map(|interval| Instant::now() + interval);

        CircuitBreaker {
            settings,
            inner: Mutex::new(Inner {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Current state, accounting for an elapsed cool-down.
    pub fn state(&self) -> State {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// Run `op` under the breaker. While open the call is rejected with
    /// `BreakerOpen` and `op` is never invoked; otherwise the outcome is
    /// recorded and the original result forwarded untouched.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let generation = self.before_call()?;
        let result = op().await;
        self.after_call(generation, result.is_ok());
        result
    }

    fn before_call(&self) -> Result<u64, CallError> {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            State::Open => Err(CallError::BreakerOpen(self.settings.name.clone())),
            State::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                Err(CallError::BreakerOpen(self.settings.name.clone()))
            }
            _ => {
                inner.counts.on_request();
                Ok(inner.generation)
            }
        }
    }

    fn after_call(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        if inner.generation != generation {
            // Outcome from a previous window; the counts no longer apply.
            return;
        }

        if success {
            inner.counts.on_success();
            match inner.state {
                State::Closed => self.evaluate_trip(&mut inner, now),
                State::HalfOpen => {
                    if inner.counts.consecutive_successes >= self.settings.max_requests {
                        self.transition(&mut inner, State::Closed, now);
                    }
                }
                State::Open => {}
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                State::Closed => self.evaluate_trip(&mut inner, now),
                State::HalfOpen => self.transition(&mut inner, State::Open, now),
                State::Open => {}
            }
        }
    }

    /// Trip check, run after every completed call while closed.
    fn evaluate_trip(&self, inner: &mut Inner, now: Instant) {
        let counts = inner.counts;
        let ratio = counts.failure_ratio();

        tracing::info!(
            breaker = %self.settings.name,
            requests = counts.requests,
            failures = counts.total_failures,
            ratio,
            "circuit breaker trip evaluation"
        );

        if counts.requests >= self.settings.min_requests && ratio >= self.settings.failure_ratio {
            self.transition(inner, State::Open, now);
        }
    }

    /// Apply time-based movement: open past its cool-down starts probing,
    /// a closed interval that ran out rolls the counting window.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            State::Closed => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        self.new_generation(inner, now);
                    }
                }
            }
            State::Open => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        self.transition(inner, State::HalfOpen, now);
                    }
                }
            }
            State::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: State, now: Instant) {
        let from = inner.state;

        if from == to {
            return;
        }

        inner.state = to;
        self.new_generation(inner, now);

        tracing::info!(
            breaker = %self.settings.name,
            from = ?from,
            to = ?to,
            "circuit breaker changed state"
        );
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            State::Closed => self.settings.interval.map(|interval| now + interval),
            State::Open => Some(now + self.settings.cooldown),
            State::HalfOpen => None,
        };
    }
}
