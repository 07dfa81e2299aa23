use std::{sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    message::Message,
    protocol::{
      acquire_supporting_tokens, acquire_supporting_tokens_async,
      correlation::CorrelationState,
      factory::{SecurityProtocolBinding, SecurityProtocolFactory, SecurityProtocolRole},
      protection_requirements::MessagePartSpecification,
      receive_header::ReceiveSecurityHeader,
      send_header::SendSecurityHeader,
      AcquiredSupportingTokens, SecurityMessageProperty, SecurityProtocol,
    },
    standards::FaultSubcode,
    time::TimeoutHelper,
    SecurityResult,
  },
  security_error,
};

/// The transport protects the message; the security header only carries a
/// timestamp and supporting tokens, whose endorsing signatures cover the
/// timestamp.
pub struct TransportSecurityProtocol {
  factory: Arc<SecurityProtocolFactory>,
  role: SecurityProtocolRole,
}

impl TransportSecurityProtocol {
  pub fn new(factory: Arc<SecurityProtocolFactory>, role: SecurityProtocolRole) -> SecurityResult<Self> {
    if !matches!(factory.binding(), SecurityProtocolBinding::Transport) {
      return Err(security_error!(
        Argument,
        "A transport protocol needs a transport binding"
      ));
    }
    Ok(TransportSecurityProtocol { factory, role })
  }

  fn secure(&self, message: &mut Message, supporting: AcquiredSupportingTokens) -> SecurityResult<()> {
    if !self.factory.include_timestamp() && supporting.is_empty() {
      return Ok(());
    }
    let mut header = SendSecurityHeader::new(&self.factory);
    for (token, specification) in supporting {
      header.add_supporting_token(token, &specification)?;
    }
    let nothing = MessagePartSpecification::default();
    header.apply(message, &nothing, &nothing)?;
    Ok(())
  }

  fn header_required(&self, action: &str) -> bool {
    self.factory.include_timestamp()
      || (!self.role.is_initiator() && !self.factory.supporting_token_authenticators(action).is_empty())
  }
}

impl SecurityProtocol for TransportSecurityProtocol {
  fn secure_outgoing_message(
    &self,
    message: &mut Message,
    timeout: Duration,
    _correlation_state: Option<&CorrelationState>,
  ) -> SecurityResult<Option<CorrelationState>> {
    let supporting = if self.role.is_initiator() {
      acquire_supporting_tokens(&self.factory, &message.action, &TimeoutHelper::new(timeout))?
    } else {
      Vec::new()
    };
    self.secure(message, supporting)?;
    Ok(None)
  }

  fn secure_outgoing_message_async<'a>(
    &'a self,
    message: &'a mut Message,
    timeout: Duration,
    _correlation_state: Option<&'a CorrelationState>,
  ) -> BoxFuture<'a, SecurityResult<Option<CorrelationState>>> {
    async move {
      let supporting = if self.role.is_initiator() {
        let helper = TimeoutHelper::new(timeout);
        acquire_supporting_tokens_async(&self.factory, &message.action, &helper).await?
      } else {
        Vec::new()
      };
      self.secure(message, supporting)?;
      Ok(None)
    }
    .boxed()
  }

  fn verify_incoming_message(
    &self,
    message: &mut Message,
    _timeout: Duration,
    _correlation_states: &[CorrelationState],
  ) -> SecurityResult<Option<CorrelationState>> {
    if message.security_header.is_none() {
      if self.header_required(&message.action) {
        return Err(
          security_error!(MessageSecurity, "The message has no security header")
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
      return Ok(None);
    }
    let mut header = ReceiveSecurityHeader::new(&self.factory, &message.action, true);
    header.process(message)?;
    if !self.role.is_initiator() {
      message.properties.security = Some(SecurityMessageProperty {
        incoming_supporting_tokens: header.take_supporting_tokens(),
        ..Default::default()
      });
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security::{
    message::MessageBody,
    protocol::factory::{
      SecurityProtocolFactoryBuilder, SupportingTokenAuthenticatorSpecification,
      SupportingTokenProviderSpecification,
    },
    tokens::{
      provider::{FixedTokenProvider, UserNameTokenAuthenticator, X509TokenAuthenticator},
      security_token::{tests::x509_token, UserNameSecurityToken},
      SecurityToken, SecurityTokenAttachmentMode, SecurityTokenAuthenticator,
      SecurityTokenParameters, SupportingTokenSpecification,
    },
  };

  const TIMEOUT: Duration = Duration::from_secs(10);

  fn pair(
    provider_token: SecurityToken,
    specification: SupportingTokenSpecification,
    authenticator: Arc<dyn SecurityTokenAuthenticator>,
  ) -> (Arc<dyn SecurityProtocol>, Arc<dyn SecurityProtocol>) {
    let client = SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Transport)
      .supporting_token_provider(
        None,
        SupportingTokenProviderSpecification {
          specification: specification.clone(),
          provider: Arc::new(FixedTokenProvider::new(provider_token)),
        },
      )
      .build()
      .unwrap();
    let service = SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Transport)
      .supporting_token_authenticator(
        None,
        SupportingTokenAuthenticatorSpecification {
          specification,
          authenticator,
        },
      )
      .build()
      .unwrap();
    (
      client.create_protocol(SecurityProtocolRole::Initiator).unwrap(),
      service.create_protocol(SecurityProtocolRole::Recipient).unwrap(),
    )
  }

  #[test]
  fn signed_user_name_token_is_authenticated() {
    let (client, service) = pair(
      UserNameSecurityToken::new("_user", "alice", "secret").into(),
      SupportingTokenSpecification::new(
        SecurityTokenParameters::user_name(),
        SecurityTokenAttachmentMode::Signed,
      ),
      Arc::new(UserNameTokenAuthenticator::new(Box::new(|user, password| {
        user == "alice" && password == "secret"
      }))),
    );
    let mut message = Message::new("urn:order", MessageBody::Empty);
    client
      .secure_outgoing_message(&mut message, TIMEOUT, None)
      .unwrap();
    service
      .verify_incoming_message(&mut message, TIMEOUT, &[])
      .unwrap();
    let property = message.properties.security.as_ref().unwrap();
    assert_eq!(property.incoming_supporting_tokens.len(), 1);
    assert!(!property.authorization_policies().is_empty());
  }

  #[test]
  fn endorsing_certificate_signs_the_timestamp() {
    let (client, service) = pair(
      x509_token("_endorser").into(),
      SupportingTokenSpecification::new(
        SecurityTokenParameters::x509(),
        SecurityTokenAttachmentMode::Endorsing,
      ),
      Arc::new(X509TokenAuthenticator::new(Duration::from_secs(300))),
    );
    let mut message = Message::new("urn:order", MessageBody::Empty);
    client
      .secure_outgoing_message(&mut message, TIMEOUT, None)
      .unwrap();
    let kinds: Vec<_> = message
      .security_header
      .as_ref()
      .unwrap()
      .elements
      .iter()
      .map(|e| e.kind_name())
      .collect();
    assert_eq!(kinds, vec!["Token", "Timestamp", "Signature"]);
    service
      .verify_incoming_message(&mut message, TIMEOUT, &[])
      .unwrap();
    let property = message.properties.security.as_ref().unwrap();
    assert_eq!(
      property.incoming_supporting_tokens[0].mode,
      SecurityTokenAttachmentMode::Endorsing
    );
  }

  #[test]
  fn missing_supporting_token_is_rejected() {
    let service = SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Transport)
      .supporting_token_authenticator(
        None,
        SupportingTokenAuthenticatorSpecification {
          specification: SupportingTokenSpecification::new(
            SecurityTokenParameters::user_name(),
            SecurityTokenAttachmentMode::Signed,
          ),
          authenticator: Arc::new(UserNameTokenAuthenticator::new(Box::new(|_, _| true))),
        },
      )
      .build()
      .unwrap()
      .create_protocol(SecurityProtocolRole::Recipient)
      .unwrap();
    let mut message = Message::new("urn:order", MessageBody::Empty);
    assert!(service
      .verify_incoming_message(&mut message, TIMEOUT, &[])
      .is_err());
  }
}
