//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::Transport;
use tokio_util::sync::CancellationToken;

use crate::context::MessageContext;
use crate::registry::ProcessorRegistry;
use crate::transport::{InMemoryTransport, OutgoingMessage};

/// Receives one message from a fresh in-memory transport and wraps it in a
/// context whose delivery count is `delivery_count` and whose dead-letter
/// limit is `limit`.
pub(crate) async fn delivered<T>(
    payload: T,
    delivery_count: u32,
    limit: u32,
) -> (MessageContext<T>, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new("test"));
    transport.send_message(
        OutgoingMessage::new(&b"{\"test\":true}"[..]).prior_deliveries(delivery_count - 1),
    );
    let message = transport
        .receive(1, Duration::from_millis(10), Duration::from_secs(30))
        .await
        .unwrap()
        .remove(0);
    let ctx = MessageContext::new(
        Arc::from("test"),
        message,
        payload,
        limit,
        ProcessorRegistry::new().create_scope(),
        CancellationToken::new(),
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    (ctx, transport)
}
