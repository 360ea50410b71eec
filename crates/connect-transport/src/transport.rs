use async_trait::async_trait;
use semver::Version;

use crate::descriptor::{Descriptor, TransportKind};
use crate::error::TransportResult;
use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireInput {
    pub path: String,
    /// Session the caller believes is live; a mismatch means another client
    /// grabbed the device in between.
    pub previous_session: Option<String>,
    pub id: Option<String>,
}

/// A medium able to discover devices and exchange framed messages with them.
///
/// Implementations must tolerate `cancel` being called concurrently with an
/// outstanding `call` on the same session; the call then resolves with
/// [`crate::TransportError::Cancelled`] or with whatever the device answered.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn enumerate(&self) -> TransportResult<Vec<Descriptor>>;

    /// Claims exclusive use of `input.path` and returns the new session id.
    async fn acquire(&self, input: AcquireInput) -> TransportResult<String>;

    async fn release(&self, session: &str, on_close: bool) -> TransportResult<()>;

    /// One request/response exchange.
    async fn call(&self, session: &str, message: Message) -> TransportResult<Message>;

    /// Writes a message without waiting for the answer.
    async fn post(&self, session: &str, message: Message) -> TransportResult<()>;

    /// Aborts outstanding reads on `session`. Other sessions keep going.
    async fn cancel(&self, session: &str) -> TransportResult<()>;

    /// Re-selects the message schema for the given firmware.
    fn reconfigure(&self, _firmware: &Version) -> TransportResult<()> {
        Ok(())
    }
}
