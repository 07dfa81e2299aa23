// Per-message security: which tokens sign and encrypt which parts, how the
// security header is laid out, and how replies are tied to their requests.
pub mod asymmetric;
pub mod correlation;
pub mod duplex;
pub mod element_manager;
pub mod factory;
pub mod protection_requirements;
pub mod receive_header;
pub mod send_header;
pub mod session;
pub mod symmetric;
pub mod token_resolver;
pub mod transport;

use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};

pub use asymmetric::AsymmetricSecurityProtocol;
pub use correlation::{CorrelationState, SignatureConfirmations};
pub use duplex::DuplexSecurityProtocol;
pub use element_manager::{
  ReceiveSecurityHeaderBindingModes, ReceiveSecurityHeaderElementCategory,
  ReceiveSecurityHeaderElementManager,
};
pub use factory::{
  MessageProtectionOrder, SecurityHeaderLayout, SecurityProtocolBinding, SecurityProtocolFactory,
  SecurityProtocolFactoryBuilder, SecurityProtocolRole, SupportingTokenAuthenticatorSpecification,
  SupportingTokenProviderSpecification,
};
pub use protection_requirements::{
  ChannelProtectionRequirements, MessagePartSpecification, ScopedMessagePartSpecification,
};
pub use session::SecuritySessionKeyState;
pub use symmetric::SymmetricSecurityProtocol;
pub use token_resolver::SecurityHeaderTokenResolver;
pub use transport::TransportSecurityProtocol;

use crate::{
  security::{
    message::Message,
    standards::FaultSubcode,
    time::TimeoutHelper,
    tokens::{
      AuthorizationPolicy, SecurityToken, SecurityTokenAttachmentMode, SupportingTokenSpecification,
    },
    SecurityResult,
  },
  security_error,
};

/// A token together with the claims its validation produced.
#[derive(Debug, Clone)]
pub struct SecurityTokenSpecification {
  pub token: SecurityToken,
  pub authorization_policies: Vec<AuthorizationPolicy>,
}

impl SecurityTokenSpecification {
  pub fn new(token: SecurityToken, authorization_policies: Vec<AuthorizationPolicy>) -> Self {
    SecurityTokenSpecification {
      token,
      authorization_policies,
    }
  }
}

#[derive(Debug, Clone)]
pub struct ReceivedSupportingToken {
  pub specification: SecurityTokenSpecification,
  pub mode: SecurityTokenAttachmentMode,
}

/// What verification of an incoming message established, attached to the
/// message for the layers above.
#[derive(Debug, Clone, Default)]
pub struct SecurityMessageProperty {
  /// Token that signed (and, symmetric binding, encrypted) the message
  pub protection_token: Option<SecurityTokenSpecification>,
  pub initiator_token: Option<SecurityTokenSpecification>,
  pub recipient_token: Option<SecurityTokenSpecification>,
  pub transport_token: Option<SecurityTokenSpecification>,
  pub incoming_supporting_tokens: Vec<ReceivedSupportingToken>,
}

impl SecurityMessageProperty {
  /// Claims of every token in the property.
  pub fn authorization_policies(&self) -> Vec<AuthorizationPolicy> {
    [
      &self.protection_token,
      &self.initiator_token,
      &self.recipient_token,
      &self.transport_token,
    ]
    .into_iter()
    .flatten()
    .chain(self.incoming_supporting_tokens.iter().map(|s| &s.specification))
    .flat_map(|spec| spec.authorization_policies.iter().cloned())
    .collect()
  }

  pub fn has_incoming_supporting_tokens(&self) -> bool {
    !self.incoming_supporting_tokens.is_empty()
  }
}

/// Applies and verifies message security for one end of a channel.
pub trait SecurityProtocol: Send + Sync {
  /// Secures `message` in place. The returned state, if any, must be handed
  /// to the verification of the reply.
  fn secure_outgoing_message(
    &self,
    message: &mut Message,
    timeout: Duration,
    correlation_state: Option<&CorrelationState>,
  ) -> SecurityResult<Option<CorrelationState>>;

  /// Completes immediately unless obtaining a token needs a round trip.
  fn secure_outgoing_message_async<'a>(
    &'a self,
    message: &'a mut Message,
    timeout: Duration,
    correlation_state: Option<&'a CorrelationState>,
  ) -> BoxFuture<'a, SecurityResult<Option<CorrelationState>>> {
    future::ready(self.secure_outgoing_message(message, timeout, correlation_state)).boxed()
  }

  /// Verifies `message` in place: decrypts protected parts and records the
  /// outcome in the message's security property. `correlation_states` are
  /// the states returned when the matching request was secured.
  fn verify_incoming_message(
    &self,
    message: &mut Message,
    timeout: Duration,
    correlation_states: &[CorrelationState],
  ) -> SecurityResult<Option<CorrelationState>>;
}

pub(crate) type AcquiredSupportingTokens = Vec<(SecurityToken, SupportingTokenSpecification)>;

pub(crate) fn acquire_supporting_tokens(
  factory: &SecurityProtocolFactory,
  action: &str,
  helper: &TimeoutHelper,
) -> SecurityResult<AcquiredSupportingTokens> {
  factory
    .supporting_token_providers(action)
    .into_iter()
    .map(|spec| {
      let token = spec.provider.get_token(helper.remaining_time())?;
      Ok((token, spec.specification.clone()))
    })
    .collect()
}

pub(crate) async fn acquire_supporting_tokens_async(
  factory: &SecurityProtocolFactory,
  action: &str,
  helper: &TimeoutHelper,
) -> SecurityResult<AcquiredSupportingTokens> {
  let mut tokens = Vec::new();
  for spec in factory.supporting_token_providers(action) {
    let token = spec.provider.get_token_async(helper.remaining_time()).await?;
    tokens.push((token, spec.specification.clone()));
  }
  Ok(tokens)
}

/// Claims for the token that protected a message. Without a configured
/// authenticator only session tokens, which carry their claims, yield any.
pub(crate) fn authenticate(
  factory: &SecurityProtocolFactory,
  token: &SecurityToken,
) -> SecurityResult<Vec<AuthorizationPolicy>> {
  match factory.token_authenticator() {
    Some(authenticator) if authenticator.can_validate_token(token) => {
      authenticator.validate_token(token)
    }
    Some(_) => Err(
      security_error!(
        MessageSecurity,
        "No authenticator accepts a {} token",
        token.kind_name()
      )
      .with_fault_subcode(FaultSubcode::InvalidSecurityToken),
    ),
    None => Ok(
      token
        .as_security_context()
        .map(|sct| sct.authorization_policies().to_vec())
        .unwrap_or_default(),
    ),
  }
}
