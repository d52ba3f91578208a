//! The seam between the supervisor and a concrete stream transport

use std::sync::Arc;

use async_trait::async_trait;
use brewlink_tokens::TokenBundle;

use crate::{ClientMessage, ServerMessage, StreamError};

/// Establishes stream connections
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    /// The connection produced
    type Connection: StreamConnection;

    /// Connects presenting the credentials in `bundle`
    ///
    /// A rejection of the credentials must be reported as
    /// [`StreamError::Unauthorized`] so that the supervisor can refresh them.
    async fn connect(&self, bundle: &TokenBundle) -> Result<Self::Connection, StreamError>;
}

#[async_trait]
impl<T: StreamConnector> StreamConnector for Arc<T> {
    type Connection = T::Connection;

    async fn connect(&self, bundle: &TokenBundle) -> Result<Self::Connection, StreamError> {
        (**self).connect(bundle).await
    }
}

/// An established stream connection
#[async_trait]
pub trait StreamConnection: Send + 'static {
    /// Sends a control message
    async fn send(&mut self, message: &ClientMessage) -> Result<(), StreamError>;

    /// Waits for the next message from the backend
    ///
    /// Returns `Ok(None)` once the backend has closed the connection. A message
    /// that cannot be decoded is reported as [`StreamError::Protocol`] and the
    /// connection remains usable.
    ///
    /// This must be cancel safe: if the future is dropped before completing,
    /// no message is lost.
    async fn receive(&mut self) -> Result<Option<ServerMessage>, StreamError>;

    /// Closes the connection
    async fn close(&mut self) -> Result<(), StreamError>;
}
