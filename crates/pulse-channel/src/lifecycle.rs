//! Connection lifecycle as a pure state machine.
//!
//! [`Lifecycle`] owns the state, the reconnect counter and the
//! intentional-close flag. Every transition returns the [`Action`]s the
//! driver must perform; nothing here touches a socket or a timer, so the
//! whole reconnect and heartbeat policy is testable without a runtime.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error};

use crate::{config::ChannelConfig, error::ChannelError, event::Event};

/// Monotonic stamp identifying one socket open.
///
/// Disconnect and every new open advance it; socket events carrying an older
/// epoch are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionEpoch(pub u64);

impl ConnectionEpoch {
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Connection state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, no reconnect scheduled.
    Disconnected,
    /// A socket open is in flight.
    Connecting,
    /// Socket open and heartbeating.
    Connected,
    /// Waiting out the reconnect interval before the next attempt.
    Reconnecting {
        /// Attempt number the pending timer will make (1-based).
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the socket is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a socket is open or opening.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    /// Open a socket stamped with `epoch`.
    Open { epoch: ConnectionEpoch },
    /// Close the live socket and abandon any in-flight open.
    Close,
    /// Arm the reconnect timer.
    ScheduleReconnect { delay: Duration, attempt: u32 },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Arm the heartbeat timer, replacing any previous one.
    StartHeartbeat,
    /// Disarm the heartbeat timer.
    StopHeartbeat,
    /// Write one heartbeat frame.
    SendPing,
    /// Deliver a lifecycle event to subscribers.
    Emit(Event),
}

impl Action {
    /// Actions that only make sense while their epoch is still current.
    /// Cleanup, and the events announcing it, always run.
    pub(crate) fn is_forward(&self) -> bool {
        matches!(
            self,
            Self::Open { .. }
                | Self::ScheduleReconnect { .. }
                | Self::StartHeartbeat
                | Self::SendPing
                | Self::Emit(Event::Connected)
        )
    }
}

/// Reconnect and heartbeat policy for a single connection.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    interval: Duration,
    intentionally_closed: bool,
    retired: bool,
    epoch: ConnectionEpoch,
    reconnect_armed: bool,
    heartbeat_armed: bool,
}

impl Lifecycle {
    /// Create a lifecycle in `Disconnected` with the config's retry policy.
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts: config.max_reconnect_attempts,
            interval: config.reconnect_interval,
            intentionally_closed: false,
            retired: false,
            epoch: ConnectionEpoch(0),
            reconnect_armed: false,
            heartbeat_armed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Automatic reconnect attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn epoch(&self) -> ConnectionEpoch {
        self.epoch
    }

    pub fn is_current(&self, epoch: ConnectionEpoch) -> bool {
        self.epoch == epoch
    }

    #[cfg(test)]
    pub fn is_intentionally_closed(&self) -> bool {
        self.intentionally_closed
    }

    /// Retired lifecycles never open again.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    #[cfg(test)]
    pub(crate) fn heartbeat_armed(&self) -> bool {
        self.heartbeat_armed
    }

    #[cfg(test)]
    pub(crate) fn reconnect_armed(&self) -> bool {
        self.reconnect_armed
    }

    /// Explicit open request.
    ///
    /// No-op while a socket is open or opening. Called while a reconnect is
    /// pending, it cancels the timer and opens right away. Called after
    /// exhaustion, it resets the counter so automatic recovery resumes.
    pub(crate) fn connect(&mut self) -> Vec<Action> {
        if self.retired {
            debug!("Connect ignored, channel retired");
            return Vec::new();
        }
        if self.state.is_active() {
            debug!(state = ?self.state, "Connect ignored, socket already active");
            return Vec::new();
        }

        self.intentionally_closed = false;
        let mut actions = Vec::new();

        if self.reconnect_armed {
            self.reconnect_armed = false;
            actions.push(Action::CancelReconnect);
        } else if self.is_exhausted() {
            self.attempts = 0;
        }

        actions.push(self.open());
        actions
    }

    /// The armed reconnect timer elapsed.
    pub(crate) fn reconnect_timer_fired(&mut self) -> Vec<Action> {
        if !self.reconnect_armed || self.intentionally_closed {
            return Vec::new();
        }
        self.reconnect_armed = false;
        debug!(attempt = self.attempts, "Reconnect timer fired");
        vec![self.open()]
    }

    /// The socket stamped `epoch` finished opening.
    pub(crate) fn opened(&mut self, epoch: ConnectionEpoch) -> Vec<Action> {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.heartbeat_armed = true;

        let mut actions = Vec::with_capacity(4);
        if self.reconnect_armed {
            self.reconnect_armed = false;
            actions.push(Action::CancelReconnect);
        }
        actions.push(Action::StopHeartbeat);
        actions.push(Action::StartHeartbeat);
        actions.push(Action::Emit(Event::Connected));
        actions
    }

    /// The socket stamped `epoch` closed without being asked to.
    pub(crate) fn closed(&mut self, epoch: ConnectionEpoch, reason: Option<String>) -> Vec<Action> {
        if !self.is_current(epoch) || !self.state.is_active() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.after_close(reason, &mut actions);
        actions
    }

    /// The socket stamped `epoch` failed, either while opening or while open.
    ///
    /// Emits `error`, then follows the regular close path. A failed open
    /// never resets the attempt counter.
    pub(crate) fn failed(&mut self, epoch: ConnectionEpoch, err: ChannelError) -> Vec<Action> {
        if !self.is_current(epoch) || !self.state.is_active() {
            return Vec::new();
        }
        let mut actions = vec![Action::Emit(Event::Error(Arc::new(err)))];
        self.after_close(None, &mut actions);
        actions
    }

    /// Intentional teardown. Safe from any state.
    pub(crate) fn disconnect(&mut self) -> Vec<Action> {
        self.intentionally_closed = true;
        self.epoch = self.epoch.next();

        let mut actions = Vec::new();
        if self.reconnect_armed {
            self.reconnect_armed = false;
            actions.push(Action::CancelReconnect);
        }
        if self.heartbeat_armed {
            self.heartbeat_armed = false;
            actions.push(Action::StopHeartbeat);
        }
        if self.state.is_active() {
            actions.push(Action::Close);
            actions.push(Action::Emit(Event::Disconnected { reason: None }));
        }

        self.state = ConnectionState::Disconnected;
        actions
    }

    /// Disconnect for good.
    pub(crate) fn retire(&mut self) -> Vec<Action> {
        self.retired = true;
        self.disconnect()
    }

    /// The heartbeat timer ticked.
    pub(crate) fn heartbeat_tick(&mut self) -> Vec<Action> {
        if self.state.is_connected() && self.heartbeat_armed {
            vec![Action::SendPing]
        } else {
            Vec::new()
        }
    }

    fn open(&mut self) -> Action {
        self.epoch = self.epoch.next();
        self.state = ConnectionState::Connecting;
        Action::Open { epoch: self.epoch }
    }

    fn after_close(&mut self, reason: Option<String>, actions: &mut Vec<Action>) {
        if self.heartbeat_armed {
            self.heartbeat_armed = false;
            actions.push(Action::StopHeartbeat);
        }
        self.state = ConnectionState::Disconnected;
        actions.push(Action::Emit(Event::Disconnected { reason }));

        if self.intentionally_closed {
            return;
        }

        if self.attempts < self.max_attempts {
            self.attempts += 1;
            self.reconnect_armed = true;
            self.state = ConnectionState::Reconnecting {
                attempt: self.attempts,
            };
            debug!(
                attempt = self.attempts,
                max = self.max_attempts,
                delay_ms = self.interval.as_millis() as u64,
                "Scheduling reconnect"
            );
            actions.push(Action::ScheduleReconnect {
                delay: self.interval,
                attempt: self.attempts,
            });
        } else {
            error!(attempts = self.attempts, "Reconnect attempts exhausted");
            actions.push(Action::Emit(Event::ReconnectFailed {
                attempts: self.attempts,
            }));
        }
    }
}
