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

/// One key protects both directions: a session token, or a random key
/// wrapped for the recipient's certificate. Replies reuse the request key.
pub struct SymmetricSecurityProtocol {
  factory: Arc<SecurityProtocolFactory>,
  role: SecurityProtocolRole,
  parameters: SecurityTokenParameters,
}

impl SymmetricSecurityProtocol {
  pub fn new(factory: Arc<SecurityProtocolFactory>, role: SecurityProtocolRole) -> SecurityResult<Self> {
    let SecurityProtocolBinding::Symmetric {
      protection_token_parameters,
    } = factory.binding()
    else {
      return Err(security_error!(
        Argument,
        "A symmetric protocol needs a symmetric binding"
      ));
    };
    let parameters = protection_token_parameters.clone();
    if role.is_initiator() && factory.token_provider().is_none() {
      return Err(security_error!(
        Argument,
        "The initiator of a symmetric binding needs a token provider"
      ));
    }
    if !role.is_initiator() && parameters.has_asymmetric_key() && factory.recipient_token().is_none() {
      return Err(security_error!(
        Argument,
        "The recipient of a symmetric binding needs its certificate to unwrap keys"
      ));
    }
    Ok(SymmetricSecurityProtocol {
      factory,
      role,
      parameters,
    })
  }

  pub fn role(&self) -> SecurityProtocolRole {
    self.role
  }

  fn derive_keys(&self) -> bool {
    self.parameters.require_derived_keys && self.parameters.supports_derived_keys()
  }

  /// Puts the protection token (or a key wrapped for it) into the header.
  /// Returns the token protecting the message and the clause naming it.
  fn request_protection(
    &self,
    header: &mut SendSecurityHeader,
    token: SecurityToken,
  ) -> SecurityResult<(SecurityToken, KeyIdentifierClause)> {
    if !self.parameters.has_asymmetric_key() {
      let include = self.parameters.should_include_token(true);
      if include {
        header.include_token(&token)?;
      }
      let clause = self.parameters.create_key_identifier_clause(&token, include)?;
      return Ok((token, clause));
    }
    let suite = self.factory.algorithm_suite();
    let wrapping_clause = token.create_key_identifier_clause(SecurityTokenReferenceStyle::External)?;
    let wrapped: SecurityToken = WrappedKeySecurityToken::create(
      header.next_id(),
      SymmetricKey::generate_random(suite.default_symmetric_key_length() / 8),
      suite.default_asymmetric_key_wrap_algorithm(),
      token,
      wrapping_clause,
    )?
    .into();
    header.include_token(&wrapped)?;
    let clause = KeyIdentifierClause::local_id(wrapped.id());
    Ok((wrapped, clause))
  }

  fn secure_request(
    &self,
    message: &mut Message,
    token: SecurityToken,
    supporting: AcquiredSupportingTokens,
  ) -> SecurityResult<Option<CorrelationState>> {
    let mut header = SendSecurityHeader::new(&self.factory);
    let (protection, clause) = self.request_protection(&mut header, token)?;
    header.set_signing_token(protection.clone(), clause.clone(), self.derive_keys())?;
    header.set_encryption_token(protection.clone(), clause, self.derive_keys())?;
    for (token, specification) in supporting {
      header.add_supporting_token(token, &specification)?;
    }
    let (signature_parts, encryption_parts) = self.factory.message_parts(&message.action, true);
    let signature_values = header.apply(message, &signature_parts, &encryption_parts)?;

    let mut correlation = CorrelationState::new(Some(protection));
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
    let token = correlation.token().cloned().ok_or_else(|| {
      security_error!(InvalidOperation, "The request state carries no protection token")
    })?;
    // the request carried the token; replies refer to it from outside
    let clause = token.create_key_identifier_clause(SecurityTokenReferenceStyle::External)?;
    let mut header = SendSecurityHeader::new(&self.factory);
    header.set_signing_token(token.clone(), clause.clone(), self.derive_keys())?;
    header.set_encryption_token(token, clause, self.derive_keys())?;
    if let Some(confirmations) = correlation.signature_confirmations() {
      header.set_signature_confirmations(confirmations.clone());
    }
    let (signature_parts, encryption_parts) = self.factory.message_parts(&message.action, true);
    header.apply(message, &signature_parts, &encryption_parts)?;
    Ok(None)
  }

  fn verify_request(&self, message: &mut Message) -> SecurityResult<Option<CorrelationState>> {
    let mut header = ReceiveSecurityHeader::new(&self.factory, &message.action, false);
    if let Some(recipient) = self.factory.recipient_token() {
      header.resolver_mut().set_expected_wrapper(recipient.clone());
    }
    header.process(message)?;

    let signature_token = header.signature_token().ok_or_else(|| {
      security_error!(MessageSecurity, "The message is not signed")
        .with_fault_subcode(FaultSubcode::InvalidSecurity)
    })?;
    let root = signature_token.root_token().clone();
    self.check_protection_token(&root)?;
    if let Some(encryption) = header.encryption_token() {
      if encryption.root_token().id() != root.id() {
        return Err(
          security_error!(
            MessageSecurity,
            "The message is encrypted with a different token than it is signed with"
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
    }
    header.enforce_derived_keys(&self.parameters)?;

    let policies = if root.is_wrapped_key() {
      Vec::new()
    } else {
      authenticate(&self.factory, &root)?
    };
    let mut correlation = CorrelationState::new(Some(root.clone()));
    if self.factory.require_signature_confirmation() {
      correlation = correlation.with_signature_confirmations(header.signature_confirmations_to_send());
    }
    message.properties.security = Some(SecurityMessageProperty {
      protection_token: Some(SecurityTokenSpecification::new(root, policies)),
      incoming_supporting_tokens: header.take_supporting_tokens(),
      ..Default::default()
    });
    Ok(Some(correlation))
  }

  // A key wrapped for our certificate must protect the message exactly when
  // the parameters ask for an asymmetric protection token.
  fn check_protection_token(&self, root: &SecurityToken) -> SecurityResult<()> {
    let acceptable = match root.as_wrapped_key() {
      Some(wrapped) => {
        self.parameters.has_asymmetric_key()
          && self
            .factory
            .recipient_token()
            .is_some_and(|r| r.id() == wrapped.wrapping_token().id())
      }
      None => !self.parameters.has_asymmetric_key() && self.parameters.matches_token_kind(root),
    };
    if acceptable {
      Ok(())
    } else {
      Err(
        security_error!(
          MessageSecurity,
          "A {} token cannot protect messages of this binding",
          root.kind_name()
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurityToken),
      )
    }
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
    let expected = correlation.token().cloned().ok_or_else(|| {
      security_error!(InvalidOperation, "The request state carries no protection token")
    })?;

    let mut header = ReceiveSecurityHeader::new(&self.factory, &message.action, false);
    header
      .resolver_mut()
      .add(expected.clone(), None, SecurityTokenReferenceStyle::External, None);
    if let Some(confirmations) = correlation.signature_confirmations() {
      header.set_expected_signature_confirmations(confirmations.clone());
    }
    header.process(message)?;

    let protected_by_request_token = header
      .signature_token()
      .is_some_and(|t| t.root_token().id() == expected.id())
      && header
        .encryption_token()
        .map_or(true, |t| t.root_token().id() == expected.id());
    if !protected_by_request_token {
      return Err(
        security_error!(
          MessageSecurity,
          "The reply is not protected with the token of its request"
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    header.enforce_derived_keys(&self.parameters)?;
    message.properties.security = Some(SecurityMessageProperty {
      protection_token: Some(SecurityTokenSpecification::new(expected, Vec::new())),
      ..Default::default()
    });
    Ok(None)
  }

  fn token_provider(&self) -> SecurityResult<&Arc<dyn SecurityTokenProvider>> {
    self
      .factory
      .token_provider()
      .ok_or_else(|| security_error!(InvalidOperation, "No token provider is configured"))
  }
}

impl SecurityProtocol for SymmetricSecurityProtocol {
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
    let token = self.token_provider()?.get_token(helper.remaining_time())?;
    let supporting = acquire_supporting_tokens(&self.factory, &message.action, &helper)?;
    self.secure_request(message, token, supporting)
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
      let token = self
        .token_provider()?
        .get_token_async(helper.remaining_time())
        .await?;
      let supporting = acquire_supporting_tokens_async(&self.factory, &message.action, &helper).await?;
      self.secure_request(message, token, supporting)
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
