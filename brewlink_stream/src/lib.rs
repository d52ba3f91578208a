//! Supervised appliance state streaming for the Breville/Sage IoT cloud
//!
//! Appliances report their state over a long-lived connection to the
//! appliance proxy. The backend remembers nothing between connections: every
//! new connection must register each appliance again before reports flow.
//!
//! A [`ConnectionSupervisor`] owns that connection. It obtains a valid token
//! from a [`TokenManager`][brewlink_tokens::TokenManager] before every attempt,
//! replays registrations for the tracked appliances in the order they were
//! added, and reconnects with jittered exponential backoff whenever the
//! connection is lost. Its progress is visible as a [`ConnectionState`].
//!
//! ```no_run
//! use brewlink_stream::{
//!     ConnectionSupervisor, SerialNumber, SupervisorConfig, WebSocketConnector,
//! };
//! use futures_util::StreamExt;
//!
//! # async fn tail(tokens: brewlink_tokens::TokenManager) {
//! let (handle, mut reports) =
//!     ConnectionSupervisor::new(WebSocketConnector::new(), tokens, SupervisorConfig::default())
//!         .spawn();
//! handle.subscribe(SerialNumber::from_static("A1B2C3"));
//!
//! while let Some(report) = reports.next().await {
//!     match report {
//!         Ok(report) => println!("{}: {:?}", report.serial_number, report.reported_state()),
//!         Err(err) if err.is_terminal() => break,
//!         Err(err) => eprintln!("{err}"),
//!     }
//! }
//! # }
//! ```
//!
//! # Features
//!
//! * `websocket` (default): Provides [`WebSocketConnector`], a transport over
//!   the appliance proxy's websocket built on `tokio-tungstenite`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod error;
pub mod lifecycle;
mod messages;
mod supervisor;
mod tracked;
mod transport;
#[cfg(feature = "websocket")]
mod websocket;

#[cfg(test)]
mod test;

pub use error::{StreamError, SupervisorError};
pub use lifecycle::ConnectionState;
pub use messages::{ClientMessage, SerialNumber, SerialNumberRef, ServerMessage, StateReport};
pub use supervisor::{
    ConnectionSupervisor, RegistrationMode, ReportStream, SupervisorConfig, SupervisorHandle,
    DEFAULT_APP, DEFAULT_MODEL,
};
pub use transport::{StreamConnection, StreamConnector};
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
pub use websocket::{WebSocketConnection, WebSocketConnector, DEFAULT_ORIGIN, DEFAULT_URL};
