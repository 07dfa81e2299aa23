use std::{sync::Arc, time::Duration};

use futures::future::{self, BoxFuture, FutureExt};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    message::Message,
    protocol::{
      correlation::CorrelationState,
      factory::{SecurityProtocolFactory, SecurityProtocolRole},
      SecurityProtocol,
    },
    SecurityResult,
  },
  security_error,
};

/// Two independent one-way protocols: `forward` secures what the initiator
/// sends, `reverse` what the recipient sends. Either may be absent unless
/// security is required in both directions, in which case messages in the
/// unsecured direction pass through untouched.
pub struct DuplexSecurityProtocol {
  outgoing: Option<Arc<dyn SecurityProtocol>>,
  incoming: Option<Arc<dyn SecurityProtocol>>,
}

impl DuplexSecurityProtocol {
  pub fn new(
    forward: Option<Arc<dyn SecurityProtocol>>,
    reverse: Option<Arc<dyn SecurityProtocol>>,
    role: SecurityProtocolRole,
    require_security_on_both_duplex_directions: bool,
  ) -> SecurityResult<Self> {
    if require_security_on_both_duplex_directions && (forward.is_none() || reverse.is_none()) {
      return Err(security_error!(
        Argument,
        "Security is required in both directions of the duplex channel"
      ));
    }
    if forward.is_none() && reverse.is_none() {
      return Err(security_error!(
        Argument,
        "A duplex protocol needs at least one secured direction"
      ));
    }
    let (outgoing, incoming) = if role.is_initiator() {
      (forward, reverse)
    } else {
      (reverse, forward)
    };
    Ok(DuplexSecurityProtocol { outgoing, incoming })
  }

  /// Builds both directions from their factories. In the reverse direction
  /// the roles swap: the recipient of the channel initiates.
  pub fn create(
    forward: Option<&Arc<SecurityProtocolFactory>>,
    reverse: Option<&Arc<SecurityProtocolFactory>>,
    role: SecurityProtocolRole,
    require_security_on_both_duplex_directions: bool,
  ) -> SecurityResult<Self> {
    let reverse_role = if role.is_initiator() {
      SecurityProtocolRole::Recipient
    } else {
      SecurityProtocolRole::Initiator
    };
    let forward = forward.map(|f| f.create_protocol(role)).transpose()?;
    let reverse = reverse.map(|f| f.create_protocol(reverse_role)).transpose()?;
    Self::new(
      forward,
      reverse,
      role,
      require_security_on_both_duplex_directions,
    )
  }

  pub fn secures_outgoing(&self) -> bool {
    self.outgoing.is_some()
  }

  pub fn verifies_incoming(&self) -> bool {
    self.incoming.is_some()
  }
}

impl SecurityProtocol for DuplexSecurityProtocol {
  fn secure_outgoing_message(
    &self,
    message: &mut Message,
    timeout: Duration,
    correlation_state: Option<&CorrelationState>,
  ) -> SecurityResult<Option<CorrelationState>> {
    match &self.outgoing {
      Some(protocol) => protocol.secure_outgoing_message(message, timeout, correlation_state),
      None => Ok(None),
    }
  }

  fn secure_outgoing_message_async<'a>(
    &'a self,
    message: &'a mut Message,
    timeout: Duration,
    correlation_state: Option<&'a CorrelationState>,
  ) -> BoxFuture<'a, SecurityResult<Option<CorrelationState>>> {
    match &self.outgoing {
      Some(protocol) => protocol.secure_outgoing_message_async(message, timeout, correlation_state),
      None => future::ready(Ok(None)).boxed(),
    }
  }

  fn verify_incoming_message(
    &self,
    message: &mut Message,
    timeout: Duration,
    correlation_states: &[CorrelationState],
  ) -> SecurityResult<Option<CorrelationState>> {
    match &self.incoming {
      Some(protocol) => protocol.verify_incoming_message(message, timeout, correlation_states),
      None => {
        if message.security_header.is_some() {
          debug!(
            "Ignoring the security header of {}: the direction is not secured",
            message.action
          );
        }
        Ok(None)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::security::{
    cryptographic::SymmetricKey,
    message::MessageBody,
    protocol::{
      factory::{SecurityProtocolBinding, SecurityProtocolFactoryBuilder},
      protection_requirements::{ChannelProtectionRequirements, ProtectionLevel},
    },
    tokens::{
      provider::{FixedTokenProvider, OutOfBandTokenResolver},
      SecurityContextSecurityToken, SecurityToken, SecurityTokenParameters,
    },
    types::UniqueId,
  };

  const TIMEOUT: Duration = Duration::from_secs(10);

  fn factories(token: &SecurityToken) -> (Arc<SecurityProtocolFactory>, Arc<SecurityProtocolFactory>) {
    let builder = || {
      SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Symmetric {
        protection_token_parameters: SecurityTokenParameters::secure_conversation(),
      })
      .protection_requirements(
        ChannelProtectionRequirements::for_all_actions(ProtectionLevel::Sign).unwrap(),
      )
    };
    (
      builder()
        .token_provider(Arc::new(FixedTokenProvider::new(token.clone())))
        .build()
        .unwrap(),
      builder()
        .out_of_band_resolver(Arc::new(OutOfBandTokenResolver::new(vec![token.clone()])))
        .build()
        .unwrap(),
    )
  }

  fn token() -> SecurityToken {
    let now = Utc::now();
    SecurityContextSecurityToken::new(
      UniqueId::new(),
      "_sct",
      SymmetricKey::generate_random(32),
      now,
      now + chrono::Duration::hours(1),
      vec![],
    )
    .into()
  }

  #[test]
  fn both_directions_required() {
    let token = token();
    let (client, _) = factories(&token);
    assert!(
      DuplexSecurityProtocol::create(Some(&client), None, SecurityProtocolRole::Initiator, true).is_err()
    );
  }

  #[test]
  fn unsecured_reverse_direction_passes_through() {
    let token = token();
    let (client_factory, service_factory) = factories(&token);
    let client =
      DuplexSecurityProtocol::create(Some(&client_factory), None, SecurityProtocolRole::Initiator, false)
        .unwrap();
    let service =
      DuplexSecurityProtocol::create(Some(&service_factory), None, SecurityProtocolRole::Recipient, false)
        .unwrap();
    assert!(client.secures_outgoing() && !client.verifies_incoming());
    assert!(!service.secures_outgoing() && service.verifies_incoming());

    let mut message = Message::new("urn:notify", MessageBody::Raw(bytes::Bytes::from_static(b"<n/>")));
    client
      .secure_outgoing_message(&mut message, TIMEOUT, None)
      .unwrap();
    service
      .verify_incoming_message(&mut message, TIMEOUT, &[])
      .unwrap();

    let mut callback = Message::new("urn:callback", MessageBody::Empty);
    service
      .secure_outgoing_message(&mut callback, TIMEOUT, None)
      .unwrap();
    assert!(callback.security_header.is_none());
    client
      .verify_incoming_message(&mut callback, TIMEOUT, &[])
      .unwrap();
  }
}
