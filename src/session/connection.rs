//! Pure connection lifecycle state machine
//!
//! This module owns the connect/disconnect/reconnect lifecycle, the backoff
//! policy and every connection-level timer (handshake timeout, reconnect
//! backoff, keep-alive). It performs no I/O: callers feed it the current
//! time and transport outcomes, and act on what it returns.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Connection state for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link and nothing scheduled
    Disconnected,
    /// Initial handshake in flight
    Connecting,
    /// CONNACK received, link usable
    Connected,
    /// Link lost; waiting for backoff or running a reconnect attempt
    Reconnecting,
    /// Handshake failed or reconnect policy exhausted; needs an explicit connect
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session left the Connected state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    UserRequested,
    BrokerClosed,
    KeepAliveTimeout,
    TransportError,
}

/// Cause carried by `error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCause {
    NetworkUnreachable,
    TlsHandshakeFailed,
    AuthenticationRejected,
    ProtocolViolation,
}

impl ErrorCause {
    /// Whether another reconnect attempt can plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCause::NetworkUnreachable | ErrorCause::TlsHandshakeFailed
        )
    }
}

/// Reconnection policy: exponential backoff, optionally jittered, and bounded
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed per reconnect cycle
    pub max_attempts: Option<u32>,
    /// Wall-clock budget per reconnect cycle
    pub max_elapsed: Option<Duration>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            max_elapsed: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// True when at least one bound stops the cycle
    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.max_elapsed.is_some()
    }

    /// Calculate backoff delay for the given attempt (1-based), without jitter
    /// Pattern: initial, 2x, 4x, ... capped at max_delay
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Backoff delay with full jitter applied when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.calculate_backoff_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Decide whether another attempt follows a failed one (pure function)
    pub fn should_attempt_reconnection(
        &self,
        attempts_made: u32,
        elapsed: Duration,
        cause: ErrorCause,
    ) -> ReconnectionDecision {
        if !self.enabled {
            return ReconnectionDecision::AbortDisabled;
        }
        if !cause.is_retryable() {
            return ReconnectionDecision::AbortNotRetryable(cause);
        }
        if let Some(max_attempts) = self.max_attempts {
            if attempts_made >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }
        if let Some(max_elapsed) = self.max_elapsed {
            if elapsed >= max_elapsed {
                return ReconnectionDecision::AbortMaxElapsedExceeded;
            }
        }
        let attempt = attempts_made + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: self.delay_for_attempt(attempt),
        }
    }
}

/// Reconnection decision result
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortDisabled,
    AbortNotRetryable(ErrorCause),
    AbortMaxAttemptsExceeded,
    AbortMaxElapsedExceeded,
}

/// Timer expiry reported by [`ConnectionStateMachine::poll_timers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Backoff elapsed; open the transport for this attempt
    StartAttempt { attempt: u32 },
    /// No CONNACK within the connect timeout
    HandshakeTimedOut,
    /// Outbound silence reached the keep-alive interval
    SendPing,
    /// No PINGRESP within the keep-alive interval
    KeepAliveExpired,
}

/// What happened after a handshake failure
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Another reconnect attempt was scheduled
    RetryScheduled { attempt: u32, delay: Duration },
    /// Terminal: the session is now Failed
    Failed { cause: ErrorCause, attempts: u32 },
    /// The failure did not belong to a live handshake
    Ignored,
}

/// What happened after an unsolicited link loss
#[derive(Debug, Clone, PartialEq)]
pub enum LinkLossOutcome {
    Reconnecting { delay: Duration },
    Disconnected,
    Ignored,
}

/// Lifecycle operation attempted from a state that does not allow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub operation: &'static str,
    pub state: ConnectionState,
}

/// Connection lifecycle for one session
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    keep_alive: Option<Duration>,
    attempts: u32,
    cycle_started: Option<Instant>,
    retry_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
    last_outbound: Option<Instant>,
    ping_deadline: Option<Instant>,
}

impl ConnectionStateMachine {
    /// `keep_alive` of `None` disables client-side pings
    pub fn new(
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        keep_alive: Option<Duration>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            connect_timeout,
            keep_alive: keep_alive.filter(|interval| !interval.is_zero()),
            attempts: 0,
            cycle_started: None,
            retry_at: None,
            handshake_deadline: None,
            last_outbound: None,
            ping_deadline: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Reconnect attempts made in the current cycle
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A handshake (initial or reconnect attempt) is running
    pub fn handshake_in_flight(&self) -> bool {
        self.handshake_deadline.is_some()
    }

    /// Begin the initial connect; valid from Disconnected or Failed
    pub fn begin_connect(&mut self, now: Instant) -> Result<(), InvalidTransition> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.clear_timers();
                self.attempts = 0;
                self.cycle_started = None;
                self.handshake_deadline = Some(now + self.connect_timeout);
                self.transition(ConnectionState::Connecting);
                Ok(())
            }
            state => Err(InvalidTransition {
                operation: "connect",
                state,
            }),
        }
    }

    /// CONNACK received for the live handshake
    pub fn handshake_succeeded(&mut self, now: Instant) -> bool {
        if !self.handshake_in_flight() {
            debug!(state = %self.state, "Ignoring CONNACK outside a handshake");
            return false;
        }
        if self.state == ConnectionState::Reconnecting {
            info!(attempt = self.attempts, "Reconnection successful");
        }
        self.clear_timers();
        self.attempts = 0;
        self.cycle_started = None;
        self.last_outbound = Some(now);
        self.transition(ConnectionState::Connected);
        true
    }

    /// Handshake failed (error or timeout)
    pub fn handshake_failed(&mut self, now: Instant, cause: ErrorCause) -> HandshakeOutcome {
        if !self.handshake_in_flight() {
            return HandshakeOutcome::Ignored;
        }
        self.handshake_deadline = None;

        match self.state {
            ConnectionState::Connecting => {
                self.transition(ConnectionState::Failed);
                HandshakeOutcome::Failed { cause, attempts: 0 }
            }
            ConnectionState::Reconnecting => {
                let elapsed = self
                    .cycle_started
                    .map_or(Duration::ZERO, |started| now.saturating_duration_since(started));
                let decision =
                    self.policy
                        .should_attempt_reconnection(self.attempts, elapsed, cause);
                match decision {
                    ReconnectionDecision::Proceed { attempt, delay } => {
                        warn!(
                            attempt = self.attempts,
                            cause = ?cause,
                            next_attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Reconnection attempt failed"
                        );
                        self.retry_at = Some(now + delay);
                        HandshakeOutcome::RetryScheduled { attempt, delay }
                    }
                    abort => {
                        error!(
                            attempts = self.attempts,
                            cause = ?cause,
                            decision = ?abort,
                            "Reconnection abandoned"
                        );
                        let attempts = self.attempts;
                        self.clear_timers();
                        self.cycle_started = None;
                        self.transition(ConnectionState::Failed);
                        HandshakeOutcome::Failed { cause, attempts }
                    }
                }
            }
            _ => HandshakeOutcome::Ignored,
        }
    }

    /// Unsolicited link loss
    pub fn link_lost(&mut self, now: Instant) -> LinkLossOutcome {
        if self.state != ConnectionState::Connected {
            return LinkLossOutcome::Ignored;
        }
        self.clear_timers();

        if self.policy.enabled {
            self.attempts = 0;
            self.cycle_started = Some(now);
            let delay = self.policy.delay_for_attempt(1);
            self.retry_at = Some(now + delay);
            self.transition(ConnectionState::Reconnecting);
            LinkLossOutcome::Reconnecting { delay }
        } else {
            self.transition(ConnectionState::Disconnected);
            LinkLossOutcome::Disconnected
        }
    }

    /// User-requested teardown from any state; returns the prior state
    pub fn disconnect(&mut self) -> ConnectionState {
        let previous = self.state;
        self.clear_timers();
        self.attempts = 0;
        self.cycle_started = None;
        if previous != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
        previous
    }

    /// Any packet written resets the keep-alive silence timer
    pub fn record_outbound(&mut self, now: Instant) {
        if self.is_connected() {
            self.last_outbound = Some(now);
        }
    }

    pub fn record_ping_response(&mut self) {
        self.ping_deadline = None;
    }

    /// Earliest pending timer, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        let keep_alive = match (self.keep_alive, self.last_outbound, self.ping_deadline) {
            (_, _, Some(deadline)) => Some(deadline),
            (Some(interval), Some(last), None) => Some(last + interval),
            _ => None,
        };
        [self.retry_at, self.handshake_deadline, keep_alive]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every expired timer, in priority order
    pub fn poll_timers(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();

        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline {
                fired.push(TimerEvent::HandshakeTimedOut);
            }
        }

        if let Some(retry_at) = self.retry_at {
            if now >= retry_at && self.state == ConnectionState::Reconnecting {
                self.retry_at = None;
                self.attempts += 1;
                self.handshake_deadline = Some(now + self.connect_timeout);
                info!(attempt = self.attempts, "Starting reconnection attempt");
                fired.push(TimerEvent::StartAttempt {
                    attempt: self.attempts,
                });
            }
        }

        if self.is_connected() {
            if let Some(interval) = self.keep_alive {
                match (self.ping_deadline, self.last_outbound) {
                    (Some(deadline), _) if now >= deadline => {
                        self.ping_deadline = None;
                        fired.push(TimerEvent::KeepAliveExpired);
                    }
                    (None, Some(last)) if now >= last + interval => {
                        self.ping_deadline = Some(now + interval);
                        self.last_outbound = Some(now);
                        fired.push(TimerEvent::SendPing);
                    }
                    _ => {}
                }
            }
        }

        fired
    }

    fn clear_timers(&mut self) {
        self.retry_at = None;
        self.handshake_deadline = None;
        self.last_outbound = None;
        self.ping_deadline = None;
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        self.state = to;
        log_state_transition(from, to);
    }
}

/// Log connection state transition (pure logging function)
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (_, ConnectionState::Failed) => error!(%from, %to, "Connection state changed"),
        (ConnectionState::Connected, _) => warn!(%from, %to, "Connection state changed"),
        _ => info!(%from, %to, "Connection state changed"),
    }
}
