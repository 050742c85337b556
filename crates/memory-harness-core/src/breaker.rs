//! Embedding circuit breaker.
//!
//! Tracks the health of embedding calls and decides whether the vector
//! half of a search may run. After `failure_threshold` consecutive
//! failures the circuit opens and every call is rejected for the current
//! cooldown. Once the cooldown has elapsed the next check moves to
//! half-open and lets exactly one trial call through: success closes the
//! circuit and resets the cooldown, failure re-opens it with the cooldown
//! doubled (capped at `max_cooldown_secs`).
//!
//! Time is passed in as epoch milliseconds, so a scripted sequence of
//! calls always produces the same state and snapshot.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::search::SearchWeights;

/// Breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Cooldown after the first trip (seconds).
    pub base_cooldown_secs: u64,
    /// Upper bound for the doubled cooldown (seconds).
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_secs: 30,
            max_cooldown_secs: 600,
        }
    }
}

impl BreakerConfig {
    fn base_cooldown_ms(&self) -> i64 {
        (self.base_cooldown_secs as i64).saturating_mul(1000)
    }

    fn max_cooldown_ms(&self) -> i64 {
        (self.max_cooldown_secs as i64).saturating_mul(1000)
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Embedding calls flow normally.
    Closed,
    /// Embedding calls are rejected until the cooldown elapses.
    Open,
    /// Cooldown elapsed; one trial call is allowed.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<i64>,
    pub tripped_at: Option<i64>,
    pub cooldown_ms: i64,
    pub trips: u32,
    pub trial_in_flight: bool,
}

/// Circuit breaker guarding embedding calls.
#[derive(Debug, Clone)]
pub struct EmbeddingCircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<i64>,
    tripped_at: Option<i64>,
    cooldown_ms: i64,
    trips: u32,
    trial_in_flight: bool,
}

impl Default for EmbeddingCircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl EmbeddingCircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            cooldown_ms: config.base_cooldown_ms(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            tripped_at: None,
            trips: 0,
            trial_in_flight: false,
        }
    }

    /// Current state as last recorded. Does not advance open → half-open;
    /// only [`allow_request`](Self::allow_request) does that.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether an embedding call may proceed at `now_ms`.
    ///
    /// In the open state this moves to half-open once the cooldown has
    /// elapsed and grants a single trial call. While it is in flight every
    /// other caller is rejected.
    pub fn allow_request(&mut self, now_ms: i64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let tripped = self.tripped_at.unwrap_or(now_ms);
                if now_ms.saturating_sub(tripped) >= self.cooldown_ms {
                    info!(
                        cooldown_ms = self.cooldown_ms,
                        "embedding breaker half-open, allowing trial call"
                    );
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful embedding call.
    pub fn record_success(&mut self, _now_ms: i64) {
        match self.state {
            CircuitState::HalfOpen => {
                info!(trips = self.trips, "embedding breaker closed after successful trial call");
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.cooldown_ms = self.config.base_cooldown_ms();
                self.tripped_at = None;
                self.trial_in_flight = false;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            // A call admitted before the trip finished late; the cooldown stands.
            CircuitState::Open => {}
        }
    }

    /// Record a failed embedding call.
    pub fn record_failure(&mut self, now_ms: i64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now_ms);

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.trip(now_ms);
                } else {
                    debug!(
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "embedding call failed"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.cooldown_ms = self
                    .cooldown_ms
                    .saturating_mul(2)
                    .min(self.config.max_cooldown_ms());
                self.trial_in_flight = false;
                self.trip(now_ms);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self, now_ms: i64) {
        self.state = CircuitState::Open;
        self.tripped_at = Some(now_ms);
        self.trips = self.trips.saturating_add(1);
        warn!(
            failures = self.consecutive_failures,
            cooldown_ms = self.cooldown_ms,
            trips = self.trips,
            "embedding breaker opened"
        );
    }

    /// Project configured search weights through the current state.
    ///
    /// Closed leaves them unchanged, open sends everything to text, and
    /// half-open moves half of the vector weight to text.
    pub fn search_weights(&self, configured: SearchWeights) -> SearchWeights {
        match self.state {
            CircuitState::Closed => configured,
            CircuitState::Open => SearchWeights {
                vector: 0.0,
                text: 1.0,
            },
            CircuitState::HalfOpen => {
                let shifted = configured.vector * 0.5;
                SearchWeights {
                    vector: configured.vector - shifted,
                    text: configured.text + shifted,
                }
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            tripped_at: self.tripped_at,
            cooldown_ms: self.cooldown_ms,
            trips: self.trips,
            trial_in_flight: self.trial_in_flight,
        }
    }

    /// Back to a fresh closed breaker with the same configuration.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }
}
