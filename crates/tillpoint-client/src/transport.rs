//! The change-feed half of the backend service.

use tokio::sync::mpsc;

use tillpoint_proto::{ChangeBinding, ChannelMessage, SubscriptionId};

/// Opens realtime channels on the backend.
pub trait RealtimeTransport: Send + Sync {
    /// Create a channel object. Nothing is sent until it subscribes.
    fn open_channel(&self, name: &str) -> Box<dyn ChannelHandle>;
}

/// One realtime channel.
///
/// Bindings may be attached before or after [`ChannelHandle::subscribe`].
/// Statuses and changes arrive on the receiver returned by `subscribe`; the
/// receiver ends once the channel is torn down.
pub trait ChannelHandle: Send {
    /// Attach a change binding.
    fn on(&mut self, binding: ChangeBinding);

    /// Detach a binding.
    fn off(&mut self, id: SubscriptionId);

    /// Ask the server to start the channel.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChannelMessage>;

    /// Tear the channel down. Calling it twice is harmless.
    fn unsubscribe(&mut self);
}
