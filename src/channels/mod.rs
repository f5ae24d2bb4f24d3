//! Mailbox sources.

pub mod imap;

use std::time::Duration;

use async_trait::async_trait;

use crate::pipeline::types::RawMessage;

pub use imap::{ImapSession, ImapSource};

/// A mailbox the orchestrator polls.
///
/// The connection is owned by the source for the duration of one cycle.
/// None of these operations fail outright: transport problems are logged
/// and surface as `false` or an empty batch.
#[async_trait]
pub trait MessageSource: Send {
    /// Provider tag, for logs.
    fn name(&self) -> &str;

    /// Open the connection. `false` on unreachable host or bad credentials.
    async fn connect(&mut self) -> bool;

    /// Unread messages received within `lookback`. Messages that cannot be
    /// extracted are skipped with a warning.
    async fn fetch_unread(&mut self, lookback: Duration) -> Vec<RawMessage>;

    /// Mark a message as read. Idempotent. Only called once the message is
    /// durably processed.
    async fn acknowledge(&mut self, source_id: &str) -> bool;

    /// Close the connection. Always called at the end of a cycle.
    async fn disconnect(&mut self);
}
