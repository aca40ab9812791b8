//! Reconnection controller.
//!
//! ```text
//!                connect()             transport open
//! Disconnected ─────────────► Connecting ─────────────► Connected
//!      ▲                        ▲    │                     │
//!      │ disconnect()           │    │ failure             │ failure / close
//!      │ (from any state)       │    ▼                     ▼
//!      │                        └─ Error ◄─────────────────┘
//!      │            retry timer /    │
//!      │            reconnect() /    │ budget spent: Exhausted,
//!      │            online, visible  │ wait for reconnect()
//! ```
//!
//! [`Reconnector`] is a pure state machine: every input returns the
//! [`Action`]s the driver must carry out (open or tear down the transport,
//! arm or cancel the retry timer). It owns no I/O and no clock, which keeps
//! every transition unit-testable.

use std::time::Duration;

/// Connection state shown to the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Retry budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Automatic retries before giving up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// `base_delay × 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start opening a transport
    Open,
    /// Drop the current transport, if any
    Teardown,
    /// Cancel the pending retry timer, if any
    CancelTimer,
    /// Arm the retry timer; `attempt` counts from 1
    ScheduleRetry { delay: Duration, attempt: u32 },
    /// Retry budget spent; surface a terminal failure to the viewer
    Exhausted { attempts: u32 },
}

/// Connection health state machine.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    exhausted: bool,
    online: bool,
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            exhausted: false,
            online: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start a session. Only acts when disconnected.
    pub fn connect(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.attempts = 0;
        self.exhausted = false;
        self.start()
    }

    /// The transport opened.
    pub fn opened(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.exhausted = false;
        Vec::new()
    }

    /// The transport failed to open, errored, or closed unexpectedly.
    pub fn failed(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Error | ConnectionState::Disconnected => return Vec::new(),
        }
        self.state = ConnectionState::Error;
        let mut actions = vec![Action::Teardown];
        if !self.online {
            return actions;
        }

        if self.attempts < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempts);
            self.attempts += 1;
            log::warn!(
                "Connection failed, retry {}/{} in {delay:?}",
                self.attempts,
                self.policy.max_attempts
            );
            actions.push(Action::ScheduleRetry {
                delay,
                attempt: self.attempts,
            });
        } else {
            self.exhausted = true;
            log::error!(
                "Connection failed after {} retries, giving up until reconnect",
                self.attempts
            );
            actions.push(Action::Exhausted {
                attempts: self.attempts,
            });
        }
        actions
    }

    /// The retry timer fired.
    pub fn retry_elapsed(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Error || self.exhausted || !self.online {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Action::Open]
    }

    /// Manual retry: cancels any pending timer and starts over with a full
    /// budget.
    pub fn reconnect(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::CancelTimer, Action::Teardown];
        self.attempts = 0;
        self.exhausted = false;
        actions.extend(self.start());
        actions
    }

    /// End the session.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.exhausted = false;
        vec![Action::CancelTimer, Action::Teardown]
    }

    /// The host lost its network. Nothing is retried until it returns.
    pub fn network_offline(&mut self) -> Vec<Action> {
        self.online = false;
        match self.state {
            ConnectionState::Disconnected => Vec::new(),
            _ => {
                self.state = ConnectionState::Error;
                vec![Action::CancelTimer, Action::Teardown]
            }
        }
    }

    pub fn network_online(&mut self) -> Vec<Action> {
        self.online = true;
        self.resume()
    }

    /// The page became visible again.
    pub fn visibility_restored(&mut self) -> Vec<Action> {
        if !self.online {
            return Vec::new();
        }
        self.resume()
    }

    fn resume(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Error | ConnectionState::Disconnected => {
                self.attempts = 0;
                self.exhausted = false;
                let mut actions = vec![Action::CancelTimer];
                actions.extend(self.start());
                actions
            }
            ConnectionState::Connecting | ConnectionState::Connected => Vec::new(),
        }
    }

    fn start(&mut self) -> Vec<Action> {
        if self.online {
            self.state = ConnectionState::Connecting;
            vec![Action::Open]
        } else {
            self.state = ConnectionState::Error;
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn connected() -> Reconnector {
        let mut machine = Reconnector::default();
        machine.connect();
        machine.opened();
        machine
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<Duration> = (0..7).map(|a| policy.delay_for(a)).collect();
        assert_eq!(
            delays,
            [ms(1000), ms(2000), ms(4000), ms(8000), ms(16000), ms(30000), ms(30000)]
        );
        assert_eq!(policy.delay_for(40), ms(30000));
    }

    #[test]
    fn test_connect_then_open() {
        let mut machine = Reconnector::default();
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        assert_eq!(machine.connect(), [Action::Open]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(machine.connect().is_empty());

        assert!(machine.opened().is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn test_failure_schedules_backoff() {
        let mut machine = connected();

        assert_eq!(
            machine.failed(),
            [
                Action::Teardown,
                Action::ScheduleRetry { delay: ms(1000), attempt: 1 }
            ]
        );
        assert_eq!(machine.state(), ConnectionState::Error);
        assert_eq!(machine.attempts(), 1);

        assert_eq!(machine.retry_elapsed(), [Action::Open]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut machine = connected();
        machine.failed();
        machine.retry_elapsed();
        machine.failed();
        assert_eq!(machine.attempts(), 2);

        machine.retry_elapsed();
        machine.opened();
        assert_eq!(machine.attempts(), 0);
        assert_eq!(
            machine.failed()[1],
            Action::ScheduleRetry { delay: ms(1000), attempt: 1 }
        );
    }

    #[test]
    fn test_budget_exhaustion_stops_retrying() {
        let mut machine = connected();
        let mut delays = Vec::new();

        loop {
            let actions = machine.failed();
            match actions.last() {
                Some(Action::ScheduleRetry { delay, .. }) => {
                    delays.push(*delay);
                    assert_eq!(machine.retry_elapsed(), [Action::Open]);
                }
                Some(Action::Exhausted { attempts }) => {
                    assert_eq!(*attempts, 5);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(delays, [ms(1000), ms(2000), ms(4000), ms(8000), ms(16000)]);
        assert_eq!(machine.state(), ConnectionState::Error);
        assert!(machine.is_exhausted());
        // Nothing moves without a manual reconnect.
        assert!(machine.retry_elapsed().is_empty());
        assert!(machine.failed().is_empty());
        assert_eq!(machine.state(), ConnectionState::Error);

        assert_eq!(
            machine.reconnect(),
            [Action::CancelTimer, Action::Teardown, Action::Open]
        );
        assert_eq!(machine.attempts(), 0);
        assert!(!machine.is_exhausted());
    }

    #[test]
    fn test_reconnect_cancels_pending_timer() {
        let mut machine = connected();
        machine.failed();
        let actions = machine.reconnect();
        assert_eq!(actions[0], Action::CancelTimer);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        let mut machine = connected();
        machine.failed();
        assert_eq!(machine.disconnect(), [Action::CancelTimer, Action::Teardown]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        // Late timer or transport results are ignored.
        assert!(machine.retry_elapsed().is_empty());
        assert!(machine.opened().is_empty());
        assert!(machine.failed().is_empty());
    }

    #[test]
    fn test_offline_parks_without_scheduling() {
        let mut machine = connected();
        assert_eq!(
            machine.network_offline(),
            [Action::CancelTimer, Action::Teardown]
        );
        assert_eq!(machine.state(), ConnectionState::Error);
        assert!(machine.retry_elapsed().is_empty());
        assert!(machine.visibility_restored().is_empty());
        // Manual reconnect while offline stays parked.
        assert_eq!(machine.reconnect(), [Action::CancelTimer, Action::Teardown]);
        assert_eq!(machine.state(), ConnectionState::Error);

        assert_eq!(machine.network_online(), [Action::CancelTimer, Action::Open]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_failure_while_offline_schedules_nothing() {
        let mut machine = Reconnector::default();
        machine.connect();
        machine.online = false;
        assert_eq!(machine.failed(), [Action::Teardown]);
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn test_online_after_exhaustion_resets_budget() {
        let mut machine = connected();
        for _ in 0..5 {
            machine.failed();
            machine.retry_elapsed();
        }
        assert!(matches!(machine.failed()[1], Action::Exhausted { .. }));

        assert_eq!(machine.visibility_restored(), [Action::CancelTimer, Action::Open]);
        assert_eq!(machine.attempts(), 0);
        assert!(!machine.is_exhausted());
    }

    #[test]
    fn test_signals_ignored_while_healthy() {
        let mut machine = connected();
        assert!(machine.network_online().is_empty());
        assert!(machine.visibility_restored().is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_signals_resume_from_disconnected() {
        let mut machine = Reconnector::default();
        assert_eq!(machine.visibility_restored(), [Action::CancelTimer, Action::Open]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }
}
