//! Reconnect policy and connection state machine for push feeds.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

use super::types::PushConfig;

/// Exponential backoff with jitter and a bounded number of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            jitter,
        }
    }

    pub fn from_config(config: &PushConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            Duration::from_millis(config.jitter_ms),
        )
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    /// Doubles each attempt up to the ceiling.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Backoff plus a random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PushConfig::default())
    }
}

/// Lifecycle of one push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next attempt
    Backoff { attempt: u32, delay: Duration },
    /// Out of attempts for this endpoint
    Exhausted,
}

/// Inputs that drive [`ConnectionStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Established,
    Failed,
    Closed,
    BackoffElapsed,
}

/// `Disconnected -> Connecting -> Connected -> Backoff -> Disconnected`,
/// ending in `Exhausted` once the policy runs out of attempts.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    failures: u32,
}

impl ConnectionStateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            failures: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Consecutive failures since the last successful connect.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == ConnectionState::Exhausted
    }

    /// Start over, e.g. after failing over to another endpoint.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.failures = 0;
    }

    /// Apply an event and return the new state. Events that make no sense
    /// in the current state are ignored.
    pub fn on_event(&mut self, event: ConnectionEvent) -> &ConnectionState {
        let current = self.state.clone();
        let next = match (current, event) {
            (ConnectionState::Disconnected, ConnectionEvent::Connect) => Some(ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionEvent::Established) => {
                self.failures = 0;
                Some(ConnectionState::Connected)
            }
            (ConnectionState::Connecting, ConnectionEvent::Failed)
            | (ConnectionState::Connecting, ConnectionEvent::Closed)
            | (ConnectionState::Connected, ConnectionEvent::Failed)
            | (ConnectionState::Connected, ConnectionEvent::Closed) => Some(self.fail()),
            (ConnectionState::Backoff { .. }, ConnectionEvent::BackoffElapsed) => Some(ConnectionState::Disconnected),
            _ => None,
        };

        match next {
            Some(state) => self.state = state,
            None => debug!("Ignoring {:?} while {:?}", event, self.state),
        }
        &self.state
    }

    fn fail(&mut self) -> ConnectionState {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            ConnectionState::Exhausted
        } else {
            ConnectionState::Backoff {
                attempt: self.failures,
                delay: self.policy.delay_for(self.failures),
            }
        }
    }
}
