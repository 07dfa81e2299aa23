//! Requestor-side negotiation state machines.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    algorithm_suite::SecurityAlgorithmSuite,
    channel::ChannelBinding,
    cryptographic::symmetric_key::{random_nonce, SymmetricKey},
    message::MessageBody,
    negotiation::{
      keying::{recover_key, validate_key_size},
      sspi::SspiNegotiation,
      state::NegotiationState,
      LegOutcome, NegotiationStateMachine,
    },
    standards::SecurityStandardsManager,
    tokens::{
      authorization_policy::{AuthorizationPolicy, NAME_CLAIM_TYPE},
      SecurityContextSecurityToken,
    },
    trust::{
      BinaryExchange, RequestSecurityToken, RequestSecurityTokenResponse,
      RequestSecurityTokenResponseCollection, RequestedProofToken, SecurityKeyEntropyMode,
    },
    types::UniqueId,
    SecurityResult,
  },
  security_error, security_log,
};

#[derive(Debug, Clone)]
pub struct ClientNegotiationSettings {
  pub standards: SecurityStandardsManager,
  pub algorithm_suite: SecurityAlgorithmSuite,
  /// Bits; the suite default when unset
  pub key_size: Option<u32>,
  pub applies_to: Option<String>,
}

impl ClientNegotiationSettings {
  fn issue_request(&self, context: &str, key_size: u32) -> SecurityResult<RequestSecurityToken> {
    let mut rst = RequestSecurityToken::issue_security_context(self.standards);
    rst.set_context(context)?;
    rst.set_key_size(key_size)?;
    if let Some(address) = &self.applies_to {
      rst.set_applies_to(address.clone())?;
    }
    Ok(rst)
  }
}

/// Builds the issued token from the response describing it.
pub(crate) fn token_from_response(
  rstr: &RequestSecurityTokenResponse,
  key: SymmetricKey,
  policies: Vec<AuthorizationPolicy>,
) -> SecurityResult<SecurityContextSecurityToken> {
  let requested = rstr.requested_security_token().ok_or_else(|| {
    security_error!(Negotiation, "The response carries no RequestedSecurityToken")
  })?;
  let lifetime = rstr
    .lifetime()
    .ok_or_else(|| security_error!(Negotiation, "The response carries no Lifetime"))?;
  let token = SecurityContextSecurityToken::new(
    requested.context_id.clone(),
    requested.id.clone(),
    key,
    lifetime.created,
    lifetime.expires,
    policies,
  );
  Ok(match &requested.generation {
    Some(generation) => {
      token.with_key_generation(generation.clone(), lifetime.created, lifetime.expires)
    }
    None => token,
  })
}

fn check_context(rstr: &RequestSecurityTokenResponse, expected: &str) -> SecurityResult<()> {
  match rstr.context() {
    Some(context) if context == expected => Ok(()),
    other => Err(security_error!(
      Negotiation,
      "Response context {other:?} does not match the request context {expected}"
    )),
  }
}

/// Multi-leg SSPI negotiation, requestor side.
pub struct SspiClientNegotiation {
  settings: ClientNegotiationSettings,
  value_type: String,
  sspi: Box<dyn SspiNegotiation>,
  state: Option<NegotiationState>,
  issued: bool,
}

impl SspiClientNegotiation {
  pub fn new(
    settings: ClientNegotiationSettings,
    value_type: String,
    sspi: Box<dyn SspiNegotiation>,
  ) -> Self {
    SspiClientNegotiation {
      settings,
      value_type,
      sspi,
      state: None,
      issued: false,
    }
  }

  pub fn state(&self) -> Option<&NegotiationState> {
    self.state.as_ref()
  }

  /// First RST. With channel-binding-aware mechanisms this is only called
  /// once the channel is open so the binding can enter the first blob.
  pub fn create_first_request(
    &mut self,
    channel_binding: Option<&ChannelBinding>,
  ) -> SecurityResult<MessageBody> {
    if self.state.is_some() {
      return Err(security_error!(InvalidOperation, "The negotiation was already started"));
    }
    let key_size = validate_key_size(self.settings.key_size, self.settings.algorithm_suite)?;
    let blob = self
      .sspi
      .get_outgoing_blob(None, channel_binding)?
      .ok_or_else(|| security_error!(Negotiation, "The negotiation produced no initial blob"))?;
    let context = UniqueId::new().to_string();
    let mut rst = self.settings.issue_request(&context, key_size)?;
    rst.set_binary_exchange(BinaryExchange::new(self.value_type.clone(), blob))?;
    rst.make_read_only();

    let mut state = NegotiationState::new(context, key_size);
    state.set_applies_to(self.settings.applies_to.clone());
    state.record_leg(&rst.canonical_bytes());
    self.state = Some(state);
    Ok(MessageBody::Rst(rst))
  }

  fn continue_leg(
    &mut self,
    rstr: &RequestSecurityTokenResponse,
  ) -> SecurityResult<LegOutcome<MessageBody, SecurityContextSecurityToken>> {
    let state = self
      .state
      .as_mut()
      .ok_or_else(|| security_error!(InvalidOperation, "The negotiation was not started"))?;
    check_context(rstr, state.context())?;
    let exchange = rstr
      .binary_exchange()
      .ok_or_else(|| security_error!(Negotiation, "The response carries no BinaryExchange"))?;
    if exchange.value_type != self.value_type {
      return Err(security_error!(
        Negotiation,
        "Unexpected BinaryExchange value type {}",
        exchange.value_type
      ));
    }
    state.record_leg(&rstr.canonical_bytes());
    let outgoing = self
      .sspi
      .get_outgoing_blob(Some(&exchange.blob), None)?
      .ok_or_else(|| {
        security_error!(
          Negotiation,
          "The server expects another leg but the negotiation has nothing to send"
        )
      })?;

    let mut next = RequestSecurityTokenResponse::new(self.settings.standards);
    next.set_context(state.context().to_string())?;
    next.set_binary_exchange(BinaryExchange::new(self.value_type.clone(), outgoing))?;
    next.make_read_only();
    state.record_leg(&next.canonical_bytes());
    Ok(LegOutcome::Continue(MessageBody::Rstr(next)))
  }

  fn final_leg(
    &mut self,
    collection: &RequestSecurityTokenResponseCollection,
  ) -> SecurityResult<LegOutcome<MessageBody, SecurityContextSecurityToken>> {
    let negotiation = collection.find(|r| r.requested_security_token().is_some())?;
    let authenticator = collection.find(|r| r.authenticator().is_some())?;
    let state = self
      .state
      .as_mut()
      .ok_or_else(|| security_error!(InvalidOperation, "The negotiation was not started"))?;
    check_context(negotiation, state.context())?;
    check_context(authenticator, state.context())?;
    state.record_leg(&negotiation.canonical_bytes());

    if let Some(exchange) = negotiation.binary_exchange() {
      if self.sspi.get_outgoing_blob(Some(&exchange.blob), None)?.is_some() {
        return Err(security_error!(
          Negotiation,
          "The server completed the negotiation but the client has more to send"
        ));
      }
    }
    if !self.sspi.is_completed() {
      return Err(security_error!(
        Negotiation,
        "The server issued a token before the negotiation completed"
      ));
    }

    let (wrap_algorithm, wrapped_key) = match negotiation.requested_proof_token() {
      Some(RequestedProofToken::EncryptedKey {
        wrap_algorithm,
        wrapped_key,
      }) => (wrap_algorithm, wrapped_key),
      _ => {
        return Err(security_error!(
          Negotiation,
          "The negotiation result carries no encrypted proof key"
        ))
      }
    };
    if wrap_algorithm != self.sspi.key_encryption_algorithm() {
      return Err(security_error!(
        Negotiation,
        "Proof key wrap algorithm {wrap_algorithm} does not match the negotiated {}",
        self.sspi.key_encryption_algorithm()
      ));
    }
    let proof_key = SymmetricKey::from_bytes(&self.sspi.decrypt_key(wrapped_key)?);

    let received = authenticator.authenticator().unwrap_or_default();
    if !state.verify_authenticator(proof_key.as_bytes(), received) {
      security_log!("Negotiation {} failed: authenticator mismatch", state.context());
      return Err(security_error!(
        Negotiation,
        "The negotiation authenticator is invalid"
      ));
    }

    let policies = self
      .sspi
      .remote_identity()
      .map(|server| {
        vec![AuthorizationPolicy::identity(
          NAME_CLAIM_TYPE,
          server,
          "negotiation",
          None,
        )]
      })
      .unwrap_or_default();
    let token = token_from_response(negotiation, proof_key, policies)?;
    state.set_issued_token(token.clone());
    self.issued = true;
    security_log!(
      "Negotiation {} completed, received context {}",
      state.context(),
      token.context_id()
    );
    Ok(LegOutcome::Completed(token))
  }
}

impl NegotiationStateMachine for SspiClientNegotiation {
  type Incoming = MessageBody;
  type Outgoing = MessageBody;
  type Completion = SecurityContextSecurityToken;

  fn leg_count(&self) -> usize {
    self.state.as_ref().map_or(0, |s| s.leg_count())
  }

  fn is_complete(&self) -> bool {
    self.issued
  }

  fn process_leg(
    &mut self,
    incoming: MessageBody,
  ) -> SecurityResult<LegOutcome<MessageBody, SecurityContextSecurityToken>> {
    if self.issued {
      return Err(security_error!(Negotiation, "The negotiation is already complete"));
    }
    match &incoming {
      MessageBody::Rstr(rstr) => self.continue_leg(rstr),
      MessageBody::RstrCollection(collection) => self.final_leg(collection),
      MessageBody::Fault(fault) => Err(fault.to_negotiation_error()),
      _ => Err(security_error!(
        Negotiation,
        "Unexpected negotiation response body"
      )),
    }
  }
}

/// Single request/response issuance over an already secured channel.
pub struct DirectClientNegotiation {
  settings: ClientNegotiationSettings,
  entropy_mode: SecurityKeyEntropyMode,
  context: Option<String>,
  key_size: u32,
  requestor_entropy: Option<Vec<u8>>,
  issued: bool,
}

impl DirectClientNegotiation {
  pub fn new(settings: ClientNegotiationSettings, entropy_mode: SecurityKeyEntropyMode) -> Self {
    DirectClientNegotiation {
      settings,
      entropy_mode,
      context: None,
      key_size: 0,
      requestor_entropy: None,
      issued: false,
    }
  }

  pub fn create_first_request(&mut self) -> SecurityResult<MessageBody> {
    if self.context.is_some() {
      return Err(security_error!(InvalidOperation, "The request was already created"));
    }
    let key_size = validate_key_size(self.settings.key_size, self.settings.algorithm_suite)?;
    let context = UniqueId::new().to_string();
    let mut rst = self.settings.issue_request(&context, key_size)?;
    if self.entropy_mode.requires_client_entropy() {
      let entropy = random_nonce((key_size / 8) as usize);
      rst.set_requestor_entropy(entropy.clone())?;
      self.requestor_entropy = Some(entropy);
    }
    rst.make_read_only();
    self.context = Some(context);
    self.key_size = key_size;
    Ok(MessageBody::Rst(rst))
  }

  fn complete(
    &mut self,
    rstr: &RequestSecurityTokenResponse,
  ) -> SecurityResult<LegOutcome<MessageBody, SecurityContextSecurityToken>> {
    let context = self
      .context
      .as_deref()
      .ok_or_else(|| security_error!(InvalidOperation, "The request was not created"))?;
    check_context(rstr, context)?;
    let key = recover_key(
      self.entropy_mode,
      self.requestor_entropy.as_deref(),
      self.key_size,
      rstr,
      &self.settings.standards,
    )?;
    let token = token_from_response(rstr, key, Vec::new())?;
    self.issued = true;
    Ok(LegOutcome::Completed(token))
  }
}

impl NegotiationStateMachine for DirectClientNegotiation {
  type Incoming = MessageBody;
  type Outgoing = MessageBody;
  type Completion = SecurityContextSecurityToken;

  fn leg_count(&self) -> usize {
    usize::from(self.context.is_some()) + usize::from(self.issued)
  }

  fn is_complete(&self) -> bool {
    self.issued
  }

  fn process_leg(
    &mut self,
    incoming: MessageBody,
  ) -> SecurityResult<LegOutcome<MessageBody, SecurityContextSecurityToken>> {
    if self.issued {
      return Err(security_error!(Negotiation, "The token was already received"));
    }
    match &incoming {
      MessageBody::Rstr(rstr) => self.complete(rstr),
      MessageBody::RstrCollection(collection) => {
        let rstr = collection.find(|r| r.requested_security_token().is_some())?;
        self.complete(rstr)
      }
      MessageBody::Fault(fault) => Err(fault.to_negotiation_error()),
      _ => Err(security_error!(Negotiation, "Unexpected issuance response body")),
    }
  }
}

/// The requestor-side variants, chosen by the token provider.
pub enum ClientNegotiation {
  Sspi(SspiClientNegotiation),
  Direct(DirectClientNegotiation),
}

impl ClientNegotiation {
  pub fn create_first_request(
    &mut self,
    channel_binding: Option<&ChannelBinding>,
  ) -> SecurityResult<MessageBody> {
    match self {
      ClientNegotiation::Sspi(n) => n.create_first_request(channel_binding),
      ClientNegotiation::Direct(n) => n.create_first_request(),
    }
  }
}

impl NegotiationStateMachine for ClientNegotiation {
  type Incoming = MessageBody;
  type Outgoing = MessageBody;
  type Completion = SecurityContextSecurityToken;

  fn leg_count(&self) -> usize {
    match self {
      ClientNegotiation::Sspi(n) => n.leg_count(),
      ClientNegotiation::Direct(n) => n.leg_count(),
    }
  }

  fn is_complete(&self) -> bool {
    match self {
      ClientNegotiation::Sspi(n) => n.is_complete(),
      ClientNegotiation::Direct(n) => n.is_complete(),
    }
  }

  fn process_leg(
    &mut self,
    incoming: MessageBody,
  ) -> SecurityResult<LegOutcome<MessageBody, SecurityContextSecurityToken>> {
    match self {
      ClientNegotiation::Sspi(n) => n.process_leg(incoming),
      ClientNegotiation::Direct(n) => n.process_leg(incoming),
    }
  }
}
