use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::message::TransportMessage;

/// The upper layer's receiving side. The dispatch engine hands each message to
///  `submit`; a message without the async-completion flag is considered done when
///  the call returns, one with the flag is done when the upper layer reports it
///  through [`crate::dispatch::DispatchEngine::message_completed`] - which may
///  happen before `submit` returns or any time after, from any task.
///
/// A sink that needs the message beyond the `submit` call retains its own handle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn submit(&self, msg: &TransportMessage);
}
