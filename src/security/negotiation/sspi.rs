use crate::security::{
  channel::ChannelBinding, standards::SecurityStandardsManager, SecurityResult,
};

/// One side of an SSPI-style handshake (SPNEGO, Kerberos, NTLM, TLS). The
/// mechanism itself is opaque: it turns incoming blobs into outgoing ones
/// until it reports completion, after which it can wrap keys with the
/// established session key.
pub trait SspiNegotiation: Send {
  /// Next blob to send. `incoming` is `None` only for the very first
  /// initiator leg. Returns `None` when the mechanism has nothing more to
  /// say.
  fn get_outgoing_blob(
    &mut self,
    incoming: Option<&[u8]>,
    channel_binding: Option<&ChannelBinding>,
  ) -> SecurityResult<Option<Vec<u8>>>;

  fn is_completed(&self) -> bool;

  /// Key wrap algorithm URI of [`encrypt_key`](Self::encrypt_key).
  fn key_encryption_algorithm(&self) -> &str;

  fn encrypt_key(&self, key: &[u8]) -> SecurityResult<Vec<u8>>;

  fn decrypt_key(&self, wrapped_key: &[u8]) -> SecurityResult<Vec<u8>>;

  /// Authenticated name of the peer, once completed.
  fn remote_identity(&self) -> Option<String>;
}

/// Creates per-negotiation [`SspiNegotiation`] instances.
pub trait SspiNegotiationFactory: Send + Sync {
  fn create_server_negotiation(&self) -> SecurityResult<Box<dyn SspiNegotiation>>;

  fn create_client_negotiation(&self, target: &str) -> SecurityResult<Box<dyn SspiNegotiation>>;

  /// `BinaryExchange` value type of the mechanism.
  fn value_type(&self, standards: &SecurityStandardsManager) -> String {
    standards.trust_version().spnego_value_type()
  }

  /// Whether the first blob must wait for the channel binding of an opened
  /// channel.
  fn uses_channel_binding(&self) -> bool {
    false
  }
}
