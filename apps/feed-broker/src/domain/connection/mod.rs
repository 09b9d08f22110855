//! Upstream Connection State Machine
//!
//! Pure transition table for the single upstream connection. Driven by two
//! kinds of input only:
//!
//! - transport events (`Opened`, `Failed`, `Dropped`, `RetryDue`)
//! - registry demand (`Demand(true)` when the first subscriber attaches,
//!   `Demand(false)` when the last one leaves)
//!
//! ```text
//!                Demand(true) / RetryDue
//!  Disconnected ─────────────────────────► Connecting
//!       ▲  ▲                                   │ Opened
//!       │  └────── Failed ─────────────────────┤
//!       │                                      ▼
//!       └──────── Dropped / Demand(false) ── Connected
//! ```
//!
//! The machine never performs I/O; it returns the effects the connection
//! manager must carry out.

use serde::Serialize;

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No stream open.
    #[default]
    Disconnected,
    /// Stream open in progress.
    Connecting,
    /// Stream established.
    Connected,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }

    /// Whether the stream is established.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    /// Registry went non-empty (`true`) or empty (`false`).
    Demand(bool),
    /// The stream opened successfully.
    Opened,
    /// The open attempt failed.
    Failed,
    /// An established stream was lost.
    Dropped,
    /// The reconnect backoff elapsed.
    RetryDue,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEffect {
    /// Open the upstream stream.
    Open,
    /// Close and release the upstream stream.
    Close,
    /// Arm the reconnect timer.
    ScheduleReconnect,
    /// Cancel the reconnect timer.
    CancelReconnect,
    /// Broadcast `connected` to subscribers.
    AnnounceConnected,
    /// Broadcast `disconnected` to subscribers.
    AnnounceDisconnected,
}

/// The connection transition table plus the two facts it depends on.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    demand: bool,
    reconnect_pending: bool,
}

impl ConnectionMachine {
    /// Create a machine in `Disconnected` with no demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a reconnect timer is armed.
    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Apply an input and return the effects to execute, in order.
    pub fn apply(&mut self, input: ConnectionInput) -> Vec<ConnectionEffect> {
        use ConnectionEffect as E;
        use ConnectionState as S;

        match input {
            ConnectionInput::Demand(true) => {
                self.demand = true;
                if self.state == S::Disconnected && !self.reconnect_pending {
                    self.state = S::Connecting;
                    vec![E::Open]
                } else {
                    vec![]
                }
            }
            ConnectionInput::Demand(false) => {
                self.demand = false;
                let mut effects = Vec::new();
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    effects.push(E::CancelReconnect);
                }
                if self.state != S::Disconnected {
                    self.state = S::Disconnected;
                    effects.push(E::Close);
                }
                effects
            }
            ConnectionInput::Opened => match self.state {
                S::Connecting if self.demand => {
                    self.state = S::Connected;
                    vec![E::AnnounceConnected]
                }
                S::Connecting => {
                    self.state = S::Disconnected;
                    vec![E::Close]
                }
                // Stale open from a released attempt.
                S::Disconnected | S::Connected => vec![E::Close],
            },
            ConnectionInput::Failed | ConnectionInput::Dropped => match self.state {
                S::Connecting | S::Connected => {
                    self.state = S::Disconnected;
                    let mut effects = vec![E::AnnounceDisconnected];
                    if self.demand {
                        self.reconnect_pending = true;
                        effects.push(E::ScheduleReconnect);
                    }
                    effects
                }
                S::Disconnected => vec![],
            },
            ConnectionInput::RetryDue => {
                self.reconnect_pending = false;
                if self.state == S::Disconnected && self.demand {
                    self.state = S::Connecting;
                    vec![E::Open]
                } else {
                    vec![]
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::ConnectionEffect as E;
    use super::ConnectionInput as I;
    use super::*;

    fn machine_after(inputs: &[ConnectionInput]) -> ConnectionMachine {
        let mut machine = ConnectionMachine::new();
        for input in inputs {
            let _ = machine.apply(*input);
        }
        machine
    }

    #[test]
    fn first_demand_opens() {
        let mut machine = ConnectionMachine::new();

        assert_eq!(machine.apply(I::Demand(true)), vec![E::Open]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn repeated_demand_opens_once() {
        let mut machine = machine_after(&[I::Demand(true)]);

        assert!(machine.apply(I::Demand(true)).is_empty());
        assert!(machine.apply(I::Opened).contains(&E::AnnounceConnected));
        assert!(machine.apply(I::Demand(true)).is_empty());
    }

    #[test_case(I::Failed ; "failed attempt")]
    #[test_case(I::Dropped ; "dropped stream")]
    fn loss_with_demand_schedules_reconnect(loss: ConnectionInput) {
        let mut machine = machine_after(&[I::Demand(true), I::Opened]);

        let effects = machine.apply(loss);

        assert_eq!(effects, vec![E::AnnounceDisconnected, E::ScheduleReconnect]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.reconnect_pending());
    }

    #[test]
    fn demand_while_reconnect_pending_waits_for_timer() {
        let mut machine = machine_after(&[I::Demand(true), I::Failed]);

        assert!(machine.apply(I::Demand(true)).is_empty());
        assert_eq!(machine.apply(I::RetryDue), vec![E::Open]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn idle_cancels_reconnect() {
        let mut machine = machine_after(&[I::Demand(true), I::Failed]);

        assert_eq!(machine.apply(I::Demand(false)), vec![E::CancelReconnect]);
        assert!(!machine.reconnect_pending());
        assert!(machine.apply(I::RetryDue).is_empty());
    }

    #[test_case(&[I::Demand(true)] ; "while connecting")]
    #[test_case(&[I::Demand(true), I::Opened] ; "while connected")]
    fn idle_closes_stream(history: &[ConnectionInput]) {
        let mut machine = machine_after(history);

        assert_eq!(machine.apply(I::Demand(false)), vec![E::Close]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_open_after_idle_is_closed() {
        let mut machine = machine_after(&[I::Demand(true), I::Demand(false)]);

        assert_eq!(machine.apply(I::Opened), vec![E::Close]);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn loss_without_demand_does_not_reconnect() {
        let mut machine = machine_after(&[I::Demand(true), I::Opened]);
        machine.demand = false;

        assert_eq!(machine.apply(I::Dropped), vec![E::AnnounceDisconnected]);
        assert!(!machine.reconnect_pending());
    }

    #[test]
    fn loss_while_disconnected_is_ignored() {
        let mut machine = ConnectionMachine::new();

        assert!(machine.apply(I::Dropped).is_empty());
        assert!(machine.apply(I::Failed).is_empty());
    }
}
