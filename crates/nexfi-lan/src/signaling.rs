use async_trait::async_trait;

use nexfi_shared::protocol::SignalEnvelope;

use crate::error::Result;

/// Outbound half of the signaling channel.
///
/// The transport behind it (a socket to the backend, a test hub) is owned by
/// the host. Inbound envelopes reach the LAN service through the
/// `mpsc::Receiver<SignalEnvelope>` passed to [`spawn_lan`](crate::spawn_lan).
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn emit(&self, envelope: SignalEnvelope) -> Result<()>;
}
