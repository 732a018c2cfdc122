//! Abstract transport seam between the exchange logic and the BLE stack.

/// Failure raised by a transport implementation.
///
/// Carries the underlying backend's message; the exchange layer only needs
/// to know that the transport, not the protocol, failed.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// A connection capable of writing command frames and delivering the
/// device's notifications.
///
/// `notification` must be cancel-safe: the caller races it against a timer
/// and will drop the future without consuming a message. `disconnect` is
/// idempotent and always safe to call during cleanup.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    async fn notification(&mut self) -> Result<Vec<u8>, TransportError>;
    async fn disconnect(&mut self);
}
