use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    cache::{
      time_bounded_cache::{CacheSettings, PurgingMode},
      SecurityContextTokenCache, TimeBoundedCache,
    },
    config::LocalServiceSecuritySettings,
    message::{Message, MessageBody},
    negotiation::{
      keying::{issue_key, validate_key_size},
      server::{
        DirectServerNegotiation, IssuanceSettings, ServerCompletion, ServerNegotiation,
        SspiServerNegotiation,
      },
      sspi::SspiNegotiationFactory,
      LegOutcome, NegotiationStateMachine,
    },
    standards::FaultSubcode,
    time::{add_saturating, utc_now},
    tokens::{key_identifier::KeyIdentifier, AuthorizationPolicy, KeyIdentifierClause},
    trust::{RequestSecurityToken, RequestSecurityTokenResponse, RequestType, SecurityKeyEntropyMode},
    types::UniqueId,
    SecurityResult,
  },
  security_error, security_log,
};

/// How the issuer establishes the context key.
#[derive(Clone)]
pub enum NegotiationMode {
  /// Multi-leg SSPI handshake; the proof key is wrapped with the session key
  /// of the mechanism.
  Sspi(Arc<dyn SspiNegotiationFactory>),
  /// Single-leg issuance to an already authenticated requestor.
  Direct(SecurityKeyEntropyMode),
}

impl NegotiationMode {
  /// Entropy mode used for direct issuance and for renewals.
  pub fn entropy_mode(&self) -> SecurityKeyEntropyMode {
    match self {
      NegotiationMode::Sspi(_) => SecurityKeyEntropyMode::CombinedEntropy,
      NegotiationMode::Direct(mode) => *mode,
    }
  }
}

type PendingNegotiation = Arc<Mutex<ServerNegotiation>>;

/// Service side of security context establishment. Runs the negotiation
/// legs, keeps unfinished negotiations (bounded in number and time), stores
/// issued tokens in the context cache and handles Cancel and Renew.
///
/// Every failure is answered with a SOAP fault; a failed negotiation is
/// abandoned and its state dropped.
pub struct NegotiationTokenAuthenticator {
  issuance: IssuanceSettings,
  mode: NegotiationMode,
  negotiation_timeout: Duration,
  pending: TimeBoundedCache<String, PendingNegotiation>,
  issued_tokens: Arc<SecurityContextTokenCache>,
}

impl NegotiationTokenAuthenticator {
  pub fn new(
    issuance: IssuanceSettings,
    mode: NegotiationMode,
    settings: &LocalServiceSecuritySettings,
    issued_tokens: Arc<SecurityContextTokenCache>,
  ) -> Self {
    let pending = TimeBoundedCache::with_default_hooks(CacheSettings {
      low_water_mark: settings.cache_low_water_mark,
      max_items: settings.max_stateful_negotiations,
      purging_mode: PurgingMode::TimerBased,
      purge_interval: settings.cache_purge_interval,
    });
    NegotiationTokenAuthenticator {
      issuance,
      mode,
      negotiation_timeout: settings.negotiation_timeout,
      pending,
      issued_tokens,
    }
  }

  pub fn issued_tokens(&self) -> &Arc<SecurityContextTokenCache> {
    &self.issued_tokens
  }

  pub fn pending_negotiations(&self) -> SecurityResult<usize> {
    Ok(self.pending.items()?.len())
  }

  /// Handles one negotiation request. Errors become a fault reply.
  pub fn process_request(&self, request: &Message) -> Message {
    match self.try_process_request(request) {
      Ok(reply) => reply,
      Err(e) => {
        security_log!("Security negotiation request {} failed: {e}", request.action);
        Message::fault_reply(request, e.to_fault(&self.issuance.standards))
      }
    }
  }

  pub fn try_process_request(&self, request: &Message) -> SecurityResult<Message> {
    let standards = &self.issuance.standards;
    let trust = standards.trust_version();
    let sc = standards.secure_conversation_version();
    let action = request.action.as_str();

    if action == sc.rst_issue_action() || action == trust.rst_issue_action() {
      self.start_negotiation(request)
    } else if action == trust.rstr_issue_action() {
      self.continue_negotiation(request)
    } else if action == sc.rst_cancel_action() {
      self.cancel(request)
    } else if action == sc.rst_renew_action() {
      self.renew(request)
    } else {
      Err(
        security_error!(Protocol, "Unsupported negotiation action {action}")
          .with_fault_subcode(FaultSubcode::InvalidRequest),
      )
    }
  }

  fn start_negotiation(&self, request: &Message) -> SecurityResult<Message> {
    let negotiation = match &self.mode {
      NegotiationMode::Sspi(factory) => ServerNegotiation::Sspi(SspiServerNegotiation::new(
        self.issuance.clone(),
        factory.value_type(&self.issuance.standards),
        factory.create_server_negotiation()?,
      )),
      NegotiationMode::Direct(entropy_mode) => {
        ServerNegotiation::Direct(DirectServerNegotiation::new(
          self.issuance.clone(),
          *entropy_mode,
          request_policies(request),
        ))
      }
    };
    self.drive(Arc::new(Mutex::new(negotiation)), request)
  }

  fn continue_negotiation(&self, request: &Message) -> SecurityResult<Message> {
    let context = match &request.body {
      MessageBody::Rstr(rstr) => rstr.context().unwrap_or_default().to_string(),
      _ => {
        return Err(security_error!(
          Negotiation,
          "Expected a RequestSecurityTokenResponse continuing a negotiation"
        ))
      }
    };
    let negotiation = self.pending.get_item(&context)?.ok_or_else(|| {
      security_error!(Negotiation, "No negotiation in progress for context {context}")
    })?;
    // whoever removes the entry owns the next leg
    if !self.pending.try_remove_item(&context)? {
      return Err(security_error!(
        Negotiation,
        "Negotiation {context} is being processed by another request"
      ));
    }
    self.drive(negotiation, request)
  }

  fn drive(&self, negotiation: PendingNegotiation, request: &Message) -> SecurityResult<Message> {
    let outcome = negotiation.lock()?.process_leg(request.body.clone())?;
    let standards = &self.issuance.standards;
    match outcome {
      LegOutcome::Continue(body) => {
        let context = match &body {
          MessageBody::Rstr(rstr) => rstr.context().unwrap_or_default().to_string(),
          _ => return Err(security_error!(Internal, "Unexpected negotiation leg body")),
        };
        let expiration = add_saturating(utc_now(), self.negotiation_timeout);
        if !self
          .pending
          .try_add_item(context.clone(), negotiation, expiration, false)?
        {
          return Err(security_error!(
            Negotiation,
            "A negotiation with context {context} is already in progress"
          ));
        }
        debug!("Negotiation {context} continues");
        Ok(Message::reply_to(
          request,
          standards.trust_version().rstr_issue_action(),
          body,
        ))
      }
      LegOutcome::Completed(ServerCompletion { reply, token }) => {
        self.issued_tokens.add_context(&token)?;
        let action = match self.mode {
          NegotiationMode::Sspi(_) => standards.trust_version().rstr_issue_final_action(),
          NegotiationMode::Direct(_) => standards.secure_conversation_version().rstr_issue_action(),
        };
        Ok(Message::reply_to(request, action, reply))
      }
    }
  }

  fn cancel(&self, request: &Message) -> SecurityResult<Message> {
    let rst = expect_request(request, RequestType::Cancel)?;
    let (context_id, _) = target_context(rst.cancel_target(), "CancelTarget")?;
    ensure_proof_of_possession(request, context_id)?;
    let removed = self.issued_tokens.remove_all_contexts(context_id)?;
    if removed == 0 {
      return Err(bad_context(context_id));
    }
    security_log!("Security context {context_id} cancelled ({removed} key generations)");

    let mut rstr = RequestSecurityTokenResponse::new(self.issuance.standards);
    if let Some(context) = rst.context() {
      rstr.set_context(context.to_string())?;
    }
    rstr.set_requested_token_cancelled(true)?;
    rstr.make_read_only();
    Ok(Message::reply_to(
      request,
      self.issuance.standards.secure_conversation_version().rstr_cancel_action(),
      MessageBody::Rstr(rstr),
    ))
  }

  fn renew(&self, request: &Message) -> SecurityResult<Message> {
    let rst = expect_request(request, RequestType::Renew)?;
    let (context_id, generation) = target_context(rst.renew_target(), "RenewTarget")?;
    ensure_proof_of_possession(request, context_id)?;
    let existing = self
      .issued_tokens
      .get_context(context_id, generation)?
      .ok_or_else(|| bad_context(context_id))?;

    let standards = &self.issuance.standards;
    let key_size = validate_key_size(rst.key_size(), self.issuance.algorithm_suite)?;
    let issued = issue_key(
      self.mode.entropy_mode(),
      rst.requestor_entropy(),
      key_size,
      standards,
    )?;
    let now = utc_now();
    let renewed = existing.renew(
      issued.key,
      now,
      add_saturating(now, self.issuance.issued_token_lifetime),
    );
    self.issued_tokens.add_context(&renewed)?;
    security_log!(
      "Security context {context_id} renewed, new key generation {:?}",
      renewed.key_generation()
    );

    let mut rstr = self
      .issuance
      .token_response(rst.context(), &renewed, key_size)?;
    if let Some(proof) = issued.proof_token {
      rstr.set_requested_proof_token(proof)?;
    }
    if let Some(entropy) = issued.issuer_entropy {
      rstr.set_issuer_entropy(entropy)?;
    }
    rstr.make_read_only();
    Ok(Message::reply_to(
      request,
      standards.secure_conversation_version().rstr_renew_action(),
      MessageBody::Rstr(rstr),
    ))
  }
}

fn expect_request(request: &Message, expected: RequestType) -> SecurityResult<&RequestSecurityToken> {
  let rst = request.expect_rst()?;
  if rst.request_type() != expected {
    return Err(
      security_error!(
        Negotiation,
        "Expected a {expected:?} request, got {:?}",
        rst.request_type()
      )
      .with_fault_subcode(FaultSubcode::InvalidRequest),
    );
  }
  Ok(rst)
}

fn target_context<'a>(
  target: Option<&'a KeyIdentifierClause>,
  element: &str,
) -> SecurityResult<(&'a UniqueId, Option<&'a UniqueId>)> {
  match target.map(|t| t.identifier()) {
    Some(KeyIdentifier::SecurityContext {
      context_id,
      generation,
    }) => Ok((context_id, generation.as_ref())),
    _ => Err(
      security_error!(
        Negotiation,
        "The request has no {element} referring to a security context"
      )
      .with_fault_subcode(FaultSubcode::InvalidRequest),
    ),
  }
}

fn bad_context(context_id: &UniqueId) -> crate::security::SecurityError {
  security_error!(MessageSecurity, "Unknown security context {context_id}")
    .with_fault_subcode(FaultSubcode::BadContextToken)
}

/// Cancel and Renew must be secured with the context they operate on.
fn ensure_proof_of_possession(request: &Message, context_id: &UniqueId) -> SecurityResult<()> {
  let proven = request
    .properties
    .security
    .as_ref()
    .and_then(|p| p.protection_token.as_ref())
    .and_then(|spec| spec.token.root_token().as_security_context())
    .map_or(false, |sct| sct.context_id() == context_id);
  if proven {
    Ok(())
  } else {
    Err(
      security_error!(
        MessageSecurity,
        "The request was not secured with security context {context_id}"
      )
      .with_fault_subcode(FaultSubcode::FailedAuthentication),
    )
  }
}

fn request_policies(request: &Message) -> Vec<AuthorizationPolicy> {
  request
    .properties
    .security
    .as_ref()
    .map(|p| p.authorization_policies())
    .unwrap_or_default()
}
