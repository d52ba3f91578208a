//! The connection lifecycle as an explicit state machine

use std::{fmt, time::Duration};

use brewlink_tokens::backoff::{ErrorBackoffConfig, ErrorBackoffHandler};
use thiserror::Error;

/// Where the streaming connection is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started
    Disconnected,
    /// Obtaining a token and establishing the connection
    Connecting,
    /// Replaying registrations for the tracked appliances
    Registering,
    /// Registered and delivering state reports
    Live,
    /// Waiting before the next connection attempt
    BackingOff,
    /// Stopped for good
    Closed,
}

impl ConnectionState {
    /// Whether the supervisor has stopped
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// The state reached when `event` happens in this state
    ///
    /// Returns `None` if the event cannot happen in this state.
    pub fn on(self, event: Event) -> Option<Self> {
        use ConnectionState::*;

        match (self, event) {
            (Closed, _) => None,
            (_, Event::Shutdown | Event::Unauthenticated) => Some(Closed),
            (Disconnected, Event::Start) => Some(Connecting),
            (Connecting, Event::Connected) => Some(Registering),
            (Registering, Event::Registered) => Some(Live),
            (Connecting | Registering | Live, Event::Lost) => Some(BackingOff),
            (BackingOff, Event::BackoffElapsed) => Some(Connecting),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Live => "live",
            Self::BackingOff => "backing off",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something that happened to the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The supervisor started
    Start,
    /// The connection was established
    Connected,
    /// Every tracked appliance was registered
    Registered,
    /// The connection failed or was lost
    Lost,
    /// The backoff delay passed
    BackoffElapsed,
    /// The credentials can no longer be refreshed
    Unauthenticated,
    /// Shutdown was requested
    Shutdown,
}

/// An event that cannot happen in the current state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("{event:?} cannot happen while {state}")]
pub struct InvalidTransition {
    /// The state the lifecycle was in
    pub state: ConnectionState,
    /// The offending event
    pub event: Event,
}

/// The outcome of applying an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// The state entered
    pub state: ConnectionState,
    /// How long to wait before reconnecting, when entering [`ConnectionState::BackingOff`]
    pub delay: Option<Duration>,
}

/// Tracks the current state together with the reconnect attempt counter
///
/// The counter increments on every loss and resets when the connection goes
/// live. Each loss yields a delay of `min(cap, base * 2^attempt)` spread by the
/// configured jitter fraction.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    backoff: ErrorBackoffHandler,
}

impl Lifecycle {
    /// Starts a lifecycle in [`ConnectionState::Disconnected`]
    pub fn new(backoff: ErrorBackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: ErrorBackoffHandler::new(backoff),
        }
    }

    /// The current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The number of losses since the connection last went live
    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Applies `event`, moving to the next state
    pub fn apply(&mut self, event: Event) -> Result<Transition, InvalidTransition> {
        let state = self.state.on(event).ok_or(InvalidTransition {
            state: self.state,
            event,
        })?;

        let delay = match event {
            Event::Lost => Some(self.backoff.error()),
            Event::Registered => {
                self.backoff.success();
                None
            }
            _ => None,
        };

        self.state = state;
        Ok(Transition { state, delay })
    }
}
