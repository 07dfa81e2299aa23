use std::{sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    cryptographic::SymmetricKey,
    message::Message,
    protocol::{
      acquire_supporting_tokens, acquire_supporting_tokens_async, authenticate,
      correlation::{CorrelationState, SignatureConfirmations},
      factory::{SecurityProtocolBinding, SecurityProtocolFactory, SecurityProtocolRole},
      receive_header::ReceiveSecurityHeader,
      send_header::SendSecurityHeader,
      AcquiredSupportingTokens, SecurityMessageProperty, SecurityProtocol,
      SecurityTokenSpecification,
    },
    standards::FaultSubcode,
    time::TimeoutHelper,
    tokens::{
      security_token::WrappedKeySecurityToken, KeyIdentifierClause, SecurityToken,
      SecurityTokenParameters, SecurityTokenProvider, SecurityTokenReferenceStyle,
    },
    SecurityResult,
  },
  security_error,
};

/// Each side signs with its own key pair and encrypts with a random key
/// wrapped for the other side's certificate.
pub struct AsymmetricSecurityProtocol {
  factory: Arc<SecurityProtocolFactory>,
  role: SecurityProtocolRole,
  initiator_parameters: SecurityTokenParameters,
  recipient_parameters: SecurityTokenParameters,
}

impl AsymmetricSecurityProtocol {
  pub fn new(factory: Arc<SecurityProtocolFactory>, role: SecurityProtocolRole) -> SecurityResult<Self> {
    let SecurityProtocolBinding::Asymmetric {
      initiator_token_parameters,
      recipient_token_parameters,
    } = factory.binding()
    else {
      return Err(security_error!(
        Argument,
        "An asymmetric protocol needs an asymmetric binding"
      ));
    };
    let (initiator_parameters, recipient_parameters) =
      (initiator_token_parameters.clone(), recipient_token_parameters.clone());
    let configured = if role.is_initiator() {
      factory.token_provider().is_some() && factory.recipient_token_provider().is_some()
    } else {
      factory.recipient_token().is_some()
    };
    if !configured {
      return Err(security_error!(
        Argument,
        "An asymmetric {:?} needs its own certificate and that of the recipient",
        role
      ));
    }
    Ok(AsymmetricSecurityProtocol {
      factory,
      role,
      initiator_parameters,
      recipient_parameters,
    })
  }

  fn own_parameters(&self) -> &SecurityTokenParameters {
    if self.role.is_initiator() {
      &self.initiator_parameters
    } else {
      &self.recipient_parameters
    }
  }

  fn peer_parameters(&self) -> &SecurityTokenParameters {
    if self.role.is_initiator() {
      &self.recipient_parameters
    } else {
      &self.initiator_parameters
    }
  }

  fn provider(&self, recipient: bool) -> SecurityResult<&Arc<dyn SecurityTokenProvider>> {
    let provider = if recipient {
      self.factory.recipient_token_provider()
    } else {
      self.factory.token_provider()
    };
    provider.ok_or_else(|| security_error!(InvalidOperation, "No token provider is configured"))
  }

  fn own_token(&self) -> SecurityResult<SecurityToken> {
    self
      .factory
      .recipient_token()
      .cloned()
      .ok_or_else(|| security_error!(InvalidOperation, "No recipient certificate is configured"))
  }

  /// Signs with `own` and, when there is anything to encrypt, encrypts with
  /// a fresh key wrapped for `peer`. Returns the signature values written.
  fn apply(
    &self,
    message: &mut Message,
    own: SecurityToken,
    peer: Option<SecurityToken>,
    supporting: AcquiredSupportingTokens,
    confirmations: Option<SignatureConfirmations>,
  ) -> SecurityResult<Vec<Vec<u8>>> {
    let suite = self.factory.algorithm_suite();
    let (signature_parts, encryption_parts) = self.factory.message_parts(&message.action, true);
    let mut header = SendSecurityHeader::new(&self.factory);

    let include = self.own_parameters().should_include_token(self.role.is_initiator());
    if include {
      header.include_token(&own)?;
    }
    let clause = self.own_parameters().create_key_identifier_clause(&own, include)?;
    header.set_signing_token(own, clause, false)?;

    if !encryption_parts.is_empty() {
      let peer = peer.ok_or_else(|| {
        security_error!(
          InvalidOperation,
          "No certificate of the other side to encrypt the message for"
        )
      })?;
      let wrapping_clause = peer.create_key_identifier_clause(SecurityTokenReferenceStyle::External)?;
      let wrapped: SecurityToken = WrappedKeySecurityToken::create(
        header.next_id(),
        SymmetricKey::generate_random(suite.default_symmetric_key_length() / 8),
        suite.default_asymmetric_key_wrap_algorithm(),
        peer,
        wrapping_clause,
      )?
      .into();
      header.include_token(&wrapped)?;
      let clause = KeyIdentifierClause::local_id(wrapped.id());
      header.set_encryption_token(wrapped, clause, false)?;
    }
    for (token, specification) in supporting {
      header.add_supporting_token(token, &specification)?;
    }
    if let Some(confirmations) = confirmations {
      header.set_signature_confirmations(confirmations);
    }
    header.apply(message, &signature_parts, &encryption_parts)
  }

  fn secure_request(
    &self,
    message: &mut Message,
    initiator: SecurityToken,
    recipient: SecurityToken,
    supporting: AcquiredSupportingTokens,
  ) -> SecurityResult<Option<CorrelationState>> {
    let signature_values = self.apply(
      message,
      initiator.clone(),
      Some(recipient.clone()),
      supporting,
      None,
    )?;
    // the reply is signed by the recipient and encrypted for the initiator
    let mut correlation = CorrelationState::new(Some(recipient)).with_peer_token(initiator);
    if self.factory.require_signature_confirmation() {
      let mut expected = SignatureConfirmations::new();
      for value in signature_values {
        expected.add(Some(value));
      }
      correlation = correlation.with_signature_confirmations(expected);
    }
    Ok(Some(correlation))
  }

  fn secure_reply(
    &self,
    message: &mut Message,
    correlation_state: Option<&CorrelationState>,
  ) -> SecurityResult<Option<CorrelationState>> {
    let correlation = correlation_state.ok_or_else(|| {
      security_error!(
        InvalidOperation,
        "A reply can only be secured with the state of its request"
      )
    })?;
    self.apply(
      message,
      self.own_token()?,
      correlation.peer_token().cloned(),
      Vec::new(),
      correlation.signature_confirmations().cloned(),
    )?;
    Ok(None)
  }

  fn verify_request(&self, message: &mut Message) -> SecurityResult<Option<CorrelationState>> {
    let own = self.own_token()?;
    let mut header = ReceiveSecurityHeader::new(&self.factory, &message.action, false);
    header.resolver_mut().set_expected_wrapper(own.clone());
    header.process(message)?;

    let initiator = header
      .signature_token()
      .map(|t| t.root_token().clone())
      .ok_or_else(|| {
        security_error!(MessageSecurity, "The message is not signed")
          .with_fault_subcode(FaultSubcode::InvalidSecurity)
      })?;
    if !self.peer_parameters().matches_token_kind(&initiator) || !initiator.has_asymmetric_key() {
      return Err(
        security_error!(
          MessageSecurity,
          "A {} token cannot sign requests of an asymmetric binding",
          initiator.kind_name()
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurityToken),
      );
    }
    check_wrapped_for(header.encryption_token(), &own)?;

    let policies = authenticate(&self.factory, &initiator)?;
    let mut correlation = CorrelationState::new(Some(initiator.clone())).with_peer_token(initiator.clone());
    if self.factory.require_signature_confirmation() {
      correlation = correlation.with_signature_confirmations(header.signature_confirmations_to_send());
    }
    message.properties.security = Some(SecurityMessageProperty {
      initiator_token: Some(SecurityTokenSpecification::new(initiator, policies)),
      recipient_token: Some(SecurityTokenSpecification::new(own, Vec::new())),
      incoming_supporting_tokens: header.take_supporting_tokens(),
      ..Default::default()
    });
    Ok(Some(correlation))
  }

  fn verify_reply(
    &self,
    message: &mut Message,
    correlation_states: &[CorrelationState],
  ) -> SecurityResult<Option<CorrelationState>> {
    let correlation = correlation_states
      .iter()
      .find(|c| c.token().is_some())
      .ok_or_else(|| {
        security_error!(
          InvalidOperation,
          "A reply can only be verified with the state of its request"
        )
      })?;
    let (Some(recipient), Some(own)) = (correlation.token(), correlation.peer_token()) else {
      return Err(security_error!(
        InvalidOperation,
        "The request state lacks the certificates of the exchange"
      ));
    };

    let mut header = ReceiveSecurityHeader::new(&self.factory, &message.action, false);
    header.resolver_mut().add(
      recipient.clone(),
      None,
      SecurityTokenReferenceStyle::External,
      Some(self.recipient_parameters.clone()),
    );
    header.resolver_mut().set_expected_wrapper(own.clone());
    if let Some(confirmations) = correlation.signature_confirmations() {
      header.set_expected_signature_confirmations(confirmations.clone());
    }
    header.process(message)?;

    if !header
      .signature_token()
      .is_some_and(|t| t.root_token().id() == recipient.id())
    {
      return Err(
        security_error!(MessageSecurity, "The reply is not signed by the recipient")
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    check_wrapped_for(header.encryption_token(), own)?;
    message.properties.security = Some(SecurityMessageProperty {
      recipient_token: Some(SecurityTokenSpecification::new(recipient.clone(), Vec::new())),
      ..Default::default()
    });
    Ok(None)
  }
}

// Encrypted parts must use a key wrapped for our own certificate.
fn check_wrapped_for(encryption: Option<&SecurityToken>, own: &SecurityToken) -> SecurityResult<()> {
  let Some(encryption) = encryption else {
    return Ok(());
  };
  let wrapped_for_us = encryption
    .root_token()
    .as_wrapped_key()
    .is_some_and(|w| w.wrapping_token().id() == own.id());
  if wrapped_for_us {
    Ok(())
  } else {
    Err(
      security_error!(
        MessageSecurity,
        "The message is not encrypted for this side's certificate"
      )
      .with_fault_subcode(FaultSubcode::InvalidSecurity),
    )
  }
}

impl SecurityProtocol for AsymmetricSecurityProtocol {
  fn secure_outgoing_message(
    &self,
    message: &mut Message,
    timeout: Duration,
    correlation_state: Option<&CorrelationState>,
  ) -> SecurityResult<Option<CorrelationState>> {
    if !self.role.is_initiator() {
      return self.secure_reply(message, correlation_state);
    }
    let helper = TimeoutHelper::new(timeout);
    let initiator = self.provider(false)?.get_token(helper.remaining_time())?;
    let recipient = self.provider(true)?.get_token(helper.remaining_time())?;
    let supporting = acquire_supporting_tokens(&self.factory, &message.action, &helper)?;
    self.secure_request(message, initiator, recipient, supporting)
  }

  fn secure_outgoing_message_async<'a>(
    &'a self,
    message: &'a mut Message,
    timeout: Duration,
    correlation_state: Option<&'a CorrelationState>,
  ) -> BoxFuture<'a, SecurityResult<Option<CorrelationState>>> {
    async move {
      if !self.role.is_initiator() {
        return self.secure_reply(message, correlation_state);
      }
      let helper = TimeoutHelper::new(timeout);
      let initiator = self
        .provider(false)?
        .get_token_async(helper.remaining_time())
        .await?;
      let recipient = self
        .provider(true)?
        .get_token_async(helper.remaining_time())
        .await?;
      let supporting = acquire_supporting_tokens_async(&self.factory, &message.action, &helper).await?;
      self.secure_request(message, initiator, recipient, supporting)
    }
    .boxed()
  }

  fn verify_incoming_message(
    &self,
    message: &mut Message,
    _timeout: Duration,
    correlation_states: &[CorrelationState],
  ) -> SecurityResult<Option<CorrelationState>> {
    if self.role.is_initiator() {
      self.verify_reply(message, correlation_states)
    } else {
      self.verify_request(message)
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration as ChronoDuration, Utc};

  use super::*;
  use crate::security::{
    cryptographic::rsa_key,
    message::MessageBody,
    protocol::{
      factory::SecurityProtocolFactoryBuilder,
      protection_requirements::{ChannelProtectionRequirements, ProtectionLevel},
    },
    tokens::{
      provider::{FixedTokenProvider, X509TokenAuthenticator},
      security_token::{tests::x509_token, X509SecurityToken},
    },
  };

  const TIMEOUT: Duration = Duration::from_secs(10);

  fn client_certificate() -> SecurityToken {
    let now = Utc::now();
    X509SecurityToken::new(
      "_client",
      "CN=client",
      rsa_key::generate_private_key(1024).unwrap(),
      now - ChronoDuration::hours(1),
      now + ChronoDuration::hours(1),
    )
    .unwrap()
    .into()
  }

  fn builder() -> SecurityProtocolFactoryBuilder {
    SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Asymmetric {
      initiator_token_parameters: SecurityTokenParameters::x509(),
      recipient_token_parameters: SecurityTokenParameters::x509(),
    })
    .require_signature_confirmation(true)
    .protection_requirements(
      ChannelProtectionRequirements::for_all_actions(ProtectionLevel::EncryptAndSign).unwrap(),
    )
  }

  fn protocols() -> (Arc<dyn SecurityProtocol>, Arc<dyn SecurityProtocol>) {
    let service_certificate: SecurityToken = x509_token("_service").into();
    let public_service_certificate: SecurityToken = x509_token("_service").public_only().into();
    let client = builder()
      .token_provider(Arc::new(FixedTokenProvider::new(client_certificate())))
      .recipient_token_provider(Arc::new(FixedTokenProvider::new(public_service_certificate)))
      .build()
      .unwrap();
    let service = builder()
      .recipient_token(service_certificate)
      .token_authenticator(Arc::new(X509TokenAuthenticator::new(Duration::from_secs(300))))
      .build()
      .unwrap();
    (
      client.create_protocol(SecurityProtocolRole::Initiator).unwrap(),
      service.create_protocol(SecurityProtocolRole::Recipient).unwrap(),
    )
  }

  #[test]
  fn request_reply_round_trip() {
    let (client, service) = protocols();
    let mut request = Message::new(
      "urn:quote",
      MessageBody::Raw(bytes::Bytes::from_static(b"<quote/>")),
    );
    let request_state = client
      .secure_outgoing_message(&mut request, TIMEOUT, None)
      .unwrap()
      .unwrap();
    let reply_state = service
      .verify_incoming_message(&mut request, TIMEOUT, &[])
      .unwrap()
      .unwrap();
    let property = request.properties.security.as_ref().unwrap();
    let initiator = property.initiator_token.as_ref().unwrap();
    assert!(initiator.token.has_asymmetric_key());
    assert!(!initiator.authorization_policies.is_empty());

    let mut reply = Message::reply_to(
      &request,
      "urn:quoteResponse",
      MessageBody::Raw(bytes::Bytes::from_static(b"<price>42</price>")),
    );
    service
      .secure_outgoing_message(&mut reply, TIMEOUT, Some(&reply_state))
      .unwrap();
    assert!(reply.body.is_encrypted());
    client
      .verify_incoming_message(&mut reply, TIMEOUT, &[request_state])
      .unwrap();
    match &reply.body {
      MessageBody::Raw(bytes) => assert_eq!(&bytes[..], b"<price>42</price>"),
      other => panic!("unexpected body {other:?}"),
    }
  }

  #[test]
  fn initiator_needs_both_certificates() {
    let factory = builder()
      .token_provider(Arc::new(FixedTokenProvider::new(client_certificate())))
      .build()
      .unwrap();
    assert!(factory.create_protocol(SecurityProtocolRole::Initiator).is_err());
  }
}
