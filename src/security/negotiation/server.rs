//! Issuer-side negotiation state machines.

use std::{fmt, time::Duration};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    algorithm_suite::SecurityAlgorithmSuite,
    cryptographic::symmetric_key::SymmetricKey,
    message::MessageBody,
    negotiation::{
      keying::{issue_key, validate_key_size},
      sspi::SspiNegotiation,
      state::NegotiationState,
      LegOutcome, NegotiationStateMachine,
    },
    standards::SecurityStandardsManager,
    time::{add_saturating, utc_now},
    tokens::{
      authorization_policy::{AuthorizationPolicy, NAME_CLAIM_TYPE},
      KeyIdentifierClause, SecurityContextSecurityToken,
    },
    trust::{
      BinaryExchange, Lifetime, RequestSecurityToken, RequestSecurityTokenResponse,
      RequestSecurityTokenResponseCollection, RequestType, RequestedProofToken,
      RequestedSecurityToken, SecurityKeyEntropyMode,
    },
    types::UniqueId,
    SecurityResult,
  },
  security_error, security_log,
};

/// What every issuer needs to mint a security context token.
#[derive(Debug, Clone)]
pub struct IssuanceSettings {
  pub standards: SecurityStandardsManager,
  pub algorithm_suite: SecurityAlgorithmSuite,
  pub issued_token_lifetime: Duration,
  pub issuer_name: String,
  /// When set, requests must name exactly this AppliesTo address.
  pub applies_to: Option<String>,
}

impl IssuanceSettings {
  /// Common request checks: Issue request type, security context token type,
  /// AppliesTo, key size. Returns the key size in bits.
  pub(crate) fn validate_issue_request(&self, rst: &RequestSecurityToken) -> SecurityResult<u32> {
    if rst.request_type() != RequestType::Issue {
      return Err(security_error!(
        Negotiation,
        "Unexpected request type {:?} in an issuance request",
        rst.request_type()
      ));
    }
    match rst.token_type() {
      Some(token_type) if self.standards.is_security_context_token_type(token_type) => {}
      other => {
        return Err(security_error!(
          Negotiation,
          "Cannot issue tokens of type {other:?}"
        ))
      }
    }
    if let Some(expected) = &self.applies_to {
      match rst.applies_to() {
        Some(address) if address == expected => {}
        other => {
          return Err(security_error!(
            Negotiation,
            "AppliesTo {other:?} does not match the endpoint {expected}"
          ))
        }
      }
    }
    validate_key_size(rst.key_size(), self.algorithm_suite)
  }

  pub(crate) fn new_token(
    &self,
    key: SymmetricKey,
    policies: Vec<AuthorizationPolicy>,
  ) -> SecurityContextSecurityToken {
    let now = utc_now();
    SecurityContextSecurityToken::new(
      UniqueId::new(),
      UniqueId::new().to_string(),
      key,
      now,
      add_saturating(now, self.issued_token_lifetime),
      policies,
    )
  }

  /// Response fields describing an issued token, without proof material.
  pub(crate) fn token_response(
    &self,
    context: Option<&str>,
    token: &SecurityContextSecurityToken,
    key_size: u32,
  ) -> SecurityResult<RequestSecurityTokenResponse> {
    let mut rstr = RequestSecurityTokenResponse::new(self.standards);
    if let Some(context) = context {
      rstr.set_context(context.to_string())?;
    }
    rstr.set_token_type(self.standards.secure_conversation_version().token_type())?;
    rstr.set_key_size(key_size)?;
    rstr.set_requested_security_token(RequestedSecurityToken {
      id: token.id().to_string(),
      context_id: token.context_id().clone(),
      generation: token.key_generation().cloned(),
    })?;
    rstr.set_requested_attached_reference(KeyIdentifierClause::local_id(token.id()))?;
    rstr.set_requested_unattached_reference(KeyIdentifierClause::security_context(
      token.context_id().clone(),
      token.key_generation().cloned(),
    ))?;
    rstr.set_lifetime(Lifetime::new(
      token.key_effective_time(),
      token.key_expiration_time(),
    ))?;
    Ok(rstr)
  }
}

/// Reply of the completing leg together with the token it issued.
pub struct ServerCompletion {
  pub reply: MessageBody,
  pub token: SecurityContextSecurityToken,
}

impl fmt::Debug for ServerCompletion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServerCompletion")
      .field("context_id", self.token.context_id())
      .finish_non_exhaustive()
  }
}

/// Multi-leg SSPI negotiation, issuer side.
pub struct SspiServerNegotiation {
  settings: IssuanceSettings,
  value_type: String,
  sspi: Box<dyn SspiNegotiation>,
  state: Option<NegotiationState>,
}

impl SspiServerNegotiation {
  pub fn new(settings: IssuanceSettings, value_type: String, sspi: Box<dyn SspiNegotiation>) -> Self {
    SspiServerNegotiation {
      settings,
      value_type,
      sspi,
      state: None,
    }
  }

  pub fn state(&self) -> Option<&NegotiationState> {
    self.state.as_ref()
  }

  fn incoming_blob<'a>(&self, exchange: Option<&'a BinaryExchange>) -> SecurityResult<&'a [u8]> {
    let exchange = exchange
      .ok_or_else(|| security_error!(Negotiation, "The negotiation message carries no BinaryExchange"))?;
    if exchange.value_type != self.value_type {
      return Err(security_error!(
        Negotiation,
        "Unexpected BinaryExchange value type {}",
        exchange.value_type
      ));
    }
    if exchange.blob.is_empty() {
      return Err(security_error!(Negotiation, "Empty negotiation blob"));
    }
    Ok(&exchange.blob)
  }

  fn first_leg(&mut self, rst: &RequestSecurityToken) -> SecurityResult<Vec<u8>> {
    let key_size = self.settings.validate_issue_request(rst)?;
    let context = match rst.context() {
      Some(context) if !context.is_empty() => context,
      _ => {
        return Err(security_error!(
          Negotiation,
          "The first negotiation message has no Context"
        ))
      }
    };
    let blob = self.incoming_blob(rst.binary_exchange())?.to_vec();
    let mut state = NegotiationState::new(context, key_size);
    state.set_applies_to(rst.applies_to().map(str::to_string));
    state.record_leg(&rst.canonical_bytes());
    self.state = Some(state);
    Ok(blob)
  }

  fn next_leg(&mut self, rstr: &RequestSecurityTokenResponse) -> SecurityResult<Vec<u8>> {
    let blob = self.incoming_blob(rstr.binary_exchange())?.to_vec();
    let state = self
      .state
      .as_mut()
      .ok_or_else(|| security_error!(Internal, "Negotiation state missing"))?;
    if rstr.context() != Some(state.context()) {
      return Err(security_error!(
        Negotiation,
        "Context {:?} does not match the negotiation context {}",
        rstr.context(),
        state.context()
      ));
    }
    state.record_leg(&rstr.canonical_bytes());
    Ok(blob)
  }

  fn continue_with(&mut self, blob: Vec<u8>) -> SecurityResult<MessageBody> {
    let state = self
      .state
      .as_mut()
      .ok_or_else(|| security_error!(Internal, "Negotiation state missing"))?;
    let mut rstr = RequestSecurityTokenResponse::new(self.settings.standards);
    rstr.set_context(state.context().to_string())?;
    rstr.set_binary_exchange(BinaryExchange::new(self.value_type.clone(), blob))?;
    rstr.make_read_only();
    state.record_leg(&rstr.canonical_bytes());
    Ok(MessageBody::Rstr(rstr))
  }

  fn complete(&mut self, final_blob: Option<Vec<u8>>) -> SecurityResult<ServerCompletion> {
    let identity = self.sspi.remote_identity().ok_or_else(|| {
      security_error!(Negotiation, "The negotiation did not establish a client identity")
    })?;
    let settings = &self.settings;
    let state = self
      .state
      .as_mut()
      .ok_or_else(|| security_error!(Internal, "Negotiation state missing"))?;

    let key = SymmetricKey::generate_random((state.key_size() / 8) as usize);
    let expiration = add_saturating(utc_now(), settings.issued_token_lifetime);
    let policies = vec![AuthorizationPolicy::identity(
      NAME_CLAIM_TYPE,
      identity.clone(),
      settings.issuer_name.clone(),
      Some(expiration),
    )];
    let token = settings.new_token(key.clone(), policies);

    let mut negotiation = settings.token_response(Some(state.context()), &token, state.key_size())?;
    negotiation.set_requested_proof_token(RequestedProofToken::EncryptedKey {
      wrap_algorithm: self.sspi.key_encryption_algorithm().to_string(),
      wrapped_key: self.sspi.encrypt_key(key.as_bytes())?,
    })?;
    if let Some(blob) = final_blob {
      negotiation.set_binary_exchange(BinaryExchange::new(self.value_type.clone(), blob))?;
    }
    negotiation.make_read_only();
    state.record_leg(&negotiation.canonical_bytes());

    let mut authenticator = RequestSecurityTokenResponse::new(settings.standards);
    authenticator.set_context(state.context().to_string())?;
    authenticator.set_authenticator(state.compute_authenticator(key.as_bytes()))?;
    authenticator.make_read_only();

    state.set_issued_token(token.clone());
    security_log!(
      "Negotiation {} completed for {identity}, issued context {}",
      state.context(),
      token.context_id()
    );
    Ok(ServerCompletion {
      reply: MessageBody::RstrCollection(RequestSecurityTokenResponseCollection::new(
        settings.standards,
        vec![negotiation, authenticator],
      )),
      token,
    })
  }
}

impl NegotiationStateMachine for SspiServerNegotiation {
  type Incoming = MessageBody;
  type Outgoing = MessageBody;
  type Completion = ServerCompletion;

  fn leg_count(&self) -> usize {
    self.state.as_ref().map_or(0, |s| s.leg_count())
  }

  fn is_complete(&self) -> bool {
    self.state.as_ref().map_or(false, |s| s.is_complete())
  }

  fn process_leg(
    &mut self,
    incoming: MessageBody,
  ) -> SecurityResult<LegOutcome<MessageBody, ServerCompletion>> {
    if self.is_complete() {
      return Err(security_error!(Negotiation, "The negotiation is already complete"));
    }
    let started = self.state.is_some();
    let blob = match (started, &incoming) {
      (false, MessageBody::Rst(rst)) => self.first_leg(rst)?,
      (true, MessageBody::Rstr(rstr)) => self.next_leg(rstr)?,
      (false, _) => {
        return Err(security_error!(
          Negotiation,
          "Expected a RequestSecurityToken to start the negotiation"
        ))
      }
      (true, _) => {
        return Err(security_error!(
          Negotiation,
          "Expected a RequestSecurityTokenResponse to continue the negotiation"
        ))
      }
    };

    let outgoing = self.sspi.get_outgoing_blob(Some(&blob), None)?;
    if self.sspi.is_completed() {
      self.complete(outgoing).map(LegOutcome::Completed)
    } else {
      let outgoing = outgoing.ok_or_else(|| {
        security_error!(
          Negotiation,
          "The negotiation is not complete but produced no outgoing blob"
        )
      })?;
      self.continue_with(outgoing).map(LegOutcome::Continue)
    }
  }
}

/// Single-leg issuance over an already authenticated channel. The issued
/// key comes from the entropy exchange instead of an SSPI session key.
pub struct DirectServerNegotiation {
  settings: IssuanceSettings,
  entropy_mode: SecurityKeyEntropyMode,
  policies: Vec<AuthorizationPolicy>,
  issued: Option<SecurityContextSecurityToken>,
}

impl DirectServerNegotiation {
  /// `policies` describe the already authenticated requestor.
  pub fn new(
    settings: IssuanceSettings,
    entropy_mode: SecurityKeyEntropyMode,
    policies: Vec<AuthorizationPolicy>,
  ) -> Self {
    DirectServerNegotiation {
      settings,
      entropy_mode,
      policies,
      issued: None,
    }
  }
}

impl NegotiationStateMachine for DirectServerNegotiation {
  type Incoming = MessageBody;
  type Outgoing = MessageBody;
  type Completion = ServerCompletion;

  fn leg_count(&self) -> usize {
    usize::from(self.issued.is_some())
  }

  fn is_complete(&self) -> bool {
    self.issued.is_some()
  }

  fn process_leg(
    &mut self,
    incoming: MessageBody,
  ) -> SecurityResult<LegOutcome<MessageBody, ServerCompletion>> {
    if self.is_complete() {
      return Err(security_error!(Negotiation, "The token was already issued"));
    }
    let rst = match &incoming {
      MessageBody::Rst(rst) => rst,
      _ => {
        return Err(security_error!(
          Negotiation,
          "Expected a RequestSecurityToken for direct issuance"
        ))
      }
    };
    if self.policies.is_empty() {
      return Err(security_error!(
        Negotiation,
        "The issuance request was not authenticated"
      ));
    }
    let settings = &self.settings;
    let key_size = settings.validate_issue_request(rst)?;
    let issued = issue_key(
      self.entropy_mode,
      rst.requestor_entropy(),
      key_size,
      &settings.standards,
    )?;
    let token = settings.new_token(issued.key, self.policies.clone());

    let mut rstr = settings.token_response(rst.context(), &token, key_size)?;
    if let Some(proof) = issued.proof_token {
      rstr.set_requested_proof_token(proof)?;
    }
    if let Some(entropy) = issued.issuer_entropy {
      rstr.set_issuer_entropy(entropy)?;
    }
    rstr.make_read_only();

    let reply = if settings.standards.trust_version().uses_response_collection() {
      MessageBody::RstrCollection(RequestSecurityTokenResponseCollection::new(
        settings.standards,
        vec![rstr],
      ))
    } else {
      MessageBody::Rstr(rstr)
    };
    self.issued = Some(token.clone());
    security_log!("Issued security context {}", token.context_id());
    Ok(LegOutcome::Completed(ServerCompletion { reply, token }))
  }
}

/// The issuer-side variants, chosen when a negotiation starts.
pub enum ServerNegotiation {
  Sspi(SspiServerNegotiation),
  Direct(DirectServerNegotiation),
}

impl NegotiationStateMachine for ServerNegotiation {
  type Incoming = MessageBody;
  type Outgoing = MessageBody;
  type Completion = ServerCompletion;

  fn leg_count(&self) -> usize {
    match self {
      ServerNegotiation::Sspi(n) => n.leg_count(),
      ServerNegotiation::Direct(n) => n.leg_count(),
    }
  }

  fn is_complete(&self) -> bool {
    match self {
      ServerNegotiation::Sspi(n) => n.is_complete(),
      ServerNegotiation::Direct(n) => n.is_complete(),
    }
  }

  fn process_leg(
    &mut self,
    incoming: MessageBody,
  ) -> SecurityResult<LegOutcome<MessageBody, ServerCompletion>> {
    match self {
      ServerNegotiation::Sspi(n) => n.process_leg(incoming),
      ServerNegotiation::Direct(n) => n.process_leg(incoming),
    }
  }
}
