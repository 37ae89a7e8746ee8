use std::sync::Arc;

use crate::types::Tick;

/// Receiver of live ticks for the instruments it subscribed to.
///
/// Ticks are delivered synchronously on the feed's reader task, so
/// implementations should hand work off quickly instead of processing inline.
pub trait TickConsumer: Send + Sync {
    fn on_tick(&self, tick: &Tick);

    fn on_subscription_success(&self, _instrument: &str) {}

    fn on_subscription_failure(&self, _instrument: &str, _reason: &str) {}
}

/// Shared handle to a consumer; identity is the pointed-to object
pub type ConsumerRef = Arc<dyn TickConsumer>;

pub(crate) fn same_consumer(a: &ConsumerRef, b: &ConsumerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
