// Establishing security contexts: the WS-Trust / WS-SecureConversation
// handshake on both ends, as SSPI-style multi-leg exchanges or as direct
// single-leg issuance.
pub mod authenticator;
pub mod client;
pub mod keying;
pub mod provider;
pub mod server;
pub mod sspi;
pub mod state;

pub use authenticator::{NegotiationMode, NegotiationTokenAuthenticator};
pub use client::{ClientNegotiation, ClientNegotiationSettings};
pub use provider::{ClientNegotiationMode, NegotiationTokenProvider};
pub use server::{IssuanceSettings, ServerCompletion, ServerNegotiation};
pub use sspi::{SspiNegotiation, SspiNegotiationFactory};
pub use state::NegotiationState;

use crate::security::SecurityResult;

/// Result of feeding one incoming message to a negotiation.
#[derive(Debug)]
pub enum LegOutcome<O, C> {
  /// Send this and wait for the next leg
  Continue(O),
  /// The negotiation is done
  Completed(C),
}

/// Common shape of every negotiation variant, issuer or requestor side.
pub trait NegotiationStateMachine {
  type Incoming;
  type Outgoing;
  type Completion;

  /// Messages exchanged so far.
  fn leg_count(&self) -> usize;

  fn is_complete(&self) -> bool;

  fn process_leg(
    &mut self,
    incoming: Self::Incoming,
  ) -> SecurityResult<LegOutcome<Self::Outgoing, Self::Completion>>;
}
