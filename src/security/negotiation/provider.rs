use std::{sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    channel::{
      ChannelFactory, CommunicationObject, CommunicationState, CommunicationStateCell,
      RequestChannel,
    },
    cryptographic::symmetric_key::random_nonce,
    message::{Message, MessageBody},
    negotiation::{
      client::{
        token_from_response, ClientNegotiation, ClientNegotiationSettings,
        DirectClientNegotiation, SspiClientNegotiation,
      },
      keying::{recover_key, validate_key_size},
      sspi::SspiNegotiationFactory,
      LegOutcome, NegotiationStateMachine,
    },
    time::TimeoutHelper,
    tokens::{
      KeyIdentifierClause, SecurityContextSecurityToken, SecurityToken, SecurityTokenProvider,
    },
    trust::{RequestSecurityToken, RequestType, SecurityKeyEntropyMode},
    types::UniqueId,
    SecurityResult,
  },
  security_error, security_log,
};

/// Upper bound on round trips of one negotiation.
pub const MAX_NEGOTIATION_LEGS: usize = 32;

#[derive(Clone)]
pub enum ClientNegotiationMode {
  Sspi(Arc<dyn SspiNegotiationFactory>),
  Direct(SecurityKeyEntropyMode),
}

impl ClientNegotiationMode {
  pub fn entropy_mode(&self) -> SecurityKeyEntropyMode {
    match self {
      ClientNegotiationMode::Sspi(_) => SecurityKeyEntropyMode::CombinedEntropy,
      ClientNegotiationMode::Direct(mode) => *mode,
    }
  }
}

/// Obtains security context tokens by negotiating with the issuer over
/// channels from a [`ChannelFactory`].
///
/// Renew and Cancel go through a separate session channel factory whose
/// channels secure requests with the session token being renewed or
/// cancelled.
pub struct NegotiationTokenProvider {
  settings: ClientNegotiationSettings,
  mode: ClientNegotiationMode,
  channel_factory: Arc<dyn ChannelFactory>,
  session_channel_factory: Option<Arc<dyn ChannelFactory>>,
  target_address: String,
  lifecycle: CommunicationStateCell,
}

impl NegotiationTokenProvider {
  pub fn new(
    settings: ClientNegotiationSettings,
    mode: ClientNegotiationMode,
    channel_factory: Arc<dyn ChannelFactory>,
    target_address: impl Into<String>,
  ) -> Self {
    NegotiationTokenProvider {
      settings,
      mode,
      channel_factory,
      session_channel_factory: None,
      target_address: target_address.into(),
      lifecycle: CommunicationStateCell::new(),
    }
  }

  pub fn with_session_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
    self.session_channel_factory = Some(factory);
    self
  }

  pub fn target_address(&self) -> &str {
    &self.target_address
  }

  fn create_negotiation(&self) -> SecurityResult<ClientNegotiation> {
    Ok(match &self.mode {
      ClientNegotiationMode::Sspi(factory) => ClientNegotiation::Sspi(SspiClientNegotiation::new(
        self.settings.clone(),
        factory.value_type(&self.settings.standards),
        factory.create_client_negotiation(&self.target_address)?,
      )),
      ClientNegotiationMode::Direct(entropy_mode) => ClientNegotiation::Direct(
        DirectClientNegotiation::new(self.settings.clone(), *entropy_mode),
      ),
    })
  }

  fn first_action(&self) -> String {
    match self.mode {
      ClientNegotiationMode::Sspi(_) => self.settings.standards.trust_version().rst_issue_action(),
      ClientNegotiationMode::Direct(_) => self
        .settings
        .standards
        .secure_conversation_version()
        .rst_issue_action(),
    }
  }

  fn reply_actions(&self) -> Vec<String> {
    let standards = self.settings.standards;
    match self.mode {
      ClientNegotiationMode::Sspi(_) => vec![
        standards.trust_version().rstr_issue_action(),
        standards.trust_version().rstr_issue_final_action(),
      ],
      ClientNegotiationMode::Direct(_) => {
        vec![standards.secure_conversation_version().rstr_issue_action()]
      }
    }
  }

  fn addressed(&self, mut message: Message) -> Message {
    message.to = Some(self.target_address.clone());
    message
  }

  /// First request. Built after the channel is open: channel-binding-aware
  /// mechanisms need the binding of the opened channel for their first blob.
  fn first_request(
    &self,
    negotiation: &mut ClientNegotiation,
    channel: &dyn RequestChannel,
  ) -> SecurityResult<Message> {
    let uses_binding = match &self.mode {
      ClientNegotiationMode::Sspi(factory) => factory.uses_channel_binding(),
      ClientNegotiationMode::Direct(_) => false,
    };
    let binding = if uses_binding {
      Some(channel.channel_binding().ok_or_else(|| {
        security_error!(
          Negotiation,
          "The negotiation requires a channel binding but the channel has none"
        )
      })?)
    } else {
      None
    };
    let body = negotiation.create_first_request(binding.as_ref())?;
    Ok(self.addressed(Message::new(self.first_action(), body)))
  }

  /// Feeds one reply to the negotiation. Returns the next request or the
  /// issued token.
  fn handle_reply(
    &self,
    negotiation: &mut ClientNegotiation,
    reply: Message,
    legs: usize,
  ) -> SecurityResult<LegOutcome<Message, SecurityContextSecurityToken>> {
    if let Some(fault) = reply.fault() {
      return Err(fault.to_negotiation_error());
    }
    check_reply_action(&reply, &self.reply_actions())?;
    if legs >= MAX_NEGOTIATION_LEGS {
      return Err(security_error!(
        Negotiation,
        "The negotiation did not complete within {MAX_NEGOTIATION_LEGS} legs"
      ));
    }
    let relates_to = reply.message_id.clone();
    match negotiation.process_leg(reply.body)? {
      LegOutcome::Continue(body) => {
        let mut next = Message::new(self.settings.standards.trust_version().rstr_issue_action(), body);
        next.relates_to = relates_to;
        Ok(LegOutcome::Continue(self.addressed(next)))
      }
      LegOutcome::Completed(token) => Ok(LegOutcome::Completed(token)),
    }
  }

  fn negotiate(
    &self,
    channel: &dyn RequestChannel,
    timeout: &TimeoutHelper,
  ) -> SecurityResult<SecurityContextSecurityToken> {
    let mut negotiation = self.create_negotiation()?;
    let mut request = self.first_request(&mut negotiation, channel)?;
    let mut legs = 0;
    loop {
      let reply = channel.request(request, timeout.check("security negotiation")?)?;
      legs += 1;
      match self.handle_reply(&mut negotiation, reply, legs)? {
        LegOutcome::Continue(next) => request = next,
        LegOutcome::Completed(token) => return Ok(token),
      }
    }
  }

  async fn negotiate_async(
    &self,
    channel: &dyn RequestChannel,
    timeout: TimeoutHelper,
  ) -> SecurityResult<SecurityContextSecurityToken> {
    let mut negotiation = self.create_negotiation()?;
    let mut request = self.first_request(&mut negotiation, channel)?;
    let mut legs = 0;
    loop {
      let remaining = timeout.check("security negotiation")?;
      let reply = channel.request_async(request, remaining).await?;
      legs += 1;
      match self.handle_reply(&mut negotiation, reply, legs)? {
        LegOutcome::Continue(next) => request = next,
        LegOutcome::Completed(token) => return Ok(token),
      }
    }
  }

  fn open_channel(
    &self,
    factory: &dyn ChannelFactory,
    timeout: &TimeoutHelper,
  ) -> SecurityResult<Box<dyn RequestChannel>> {
    self.lifecycle.ensure_opened()?;
    let channel = factory.create_channel(&self.target_address)?;
    channel.open(timeout.check("open the negotiation channel")?)?;
    Ok(channel)
  }

  fn finish_channel<T>(
    channel: &dyn RequestChannel,
    result: SecurityResult<T>,
    timeout: &TimeoutHelper,
  ) -> SecurityResult<T> {
    match &result {
      Ok(_) => {
        if let Err(e) = channel.close(timeout.remaining_time()) {
          warn!("Closing the negotiation channel failed: {e}");
          channel.abort();
        }
      }
      Err(_) => channel.abort(),
    }
    result
  }

  fn session_request(
    &self,
    timeout: Duration,
    action: String,
    reply_action: String,
    rst: RequestSecurityToken,
  ) -> SecurityResult<Message> {
    let factory = self.session_channel_factory.as_ref().ok_or_else(|| {
      security_error!(
        InvalidOperation,
        "No session channel factory is configured for renewal and cancellation"
      )
    })?;
    let helper = TimeoutHelper::new(timeout);
    let channel = self.open_channel(factory.as_ref(), &helper)?;
    let request = self.addressed(Message::new(action, MessageBody::Rst(rst)));
    let result = channel
      .request(request, helper.check("security session request")?)
      .and_then(|reply| match reply.fault() {
        Some(fault) => Err(fault.to_negotiation_error()),
        None => check_reply_action(&reply, &[reply_action]).map(|_| reply),
      });
    Self::finish_channel(channel.as_ref(), result, &helper)
  }

  fn context_clause(token: &SecurityContextSecurityToken) -> KeyIdentifierClause {
    KeyIdentifierClause::security_context(
      token.context_id().clone(),
      token.key_generation().cloned(),
    )
  }
}

fn check_reply_action(reply: &Message, expected: &[String]) -> SecurityResult<()> {
  if expected.iter().any(|a| *a == reply.action) {
    Ok(())
  } else {
    Err(security_error!(
      Protocol,
      "Unexpected negotiation reply action {}",
      reply.action
    ))
  }
}

fn expect_session_token(token: &SecurityToken) -> SecurityResult<&SecurityContextSecurityToken> {
  token.as_security_context().ok_or_else(|| {
    security_error!(
      Argument,
      "Expected a security context token, got {}",
      token.kind_name()
    )
  })
}

impl SecurityTokenProvider for NegotiationTokenProvider {
  fn get_token(&self, timeout: Duration) -> SecurityResult<SecurityToken> {
    let helper = TimeoutHelper::new(timeout);
    let channel = self.open_channel(self.channel_factory.as_ref(), &helper)?;
    let result = self.negotiate(channel.as_ref(), &helper);
    if let Err(e) = &result {
      security_log!("Security negotiation with {} failed: {e}", self.target_address);
    }
    Self::finish_channel(channel.as_ref(), result, &helper).map(SecurityToken::SecurityContext)
  }

  fn get_token_async(&self, timeout: Duration) -> BoxFuture<'_, SecurityResult<SecurityToken>> {
    async move {
      let helper = TimeoutHelper::new(timeout);
      let channel = self.open_channel(self.channel_factory.as_ref(), &helper)?;
      let result = self.negotiate_async(channel.as_ref(), helper).await;
      if let Err(e) = &result {
        security_log!("Security negotiation with {} failed: {e}", self.target_address);
      }
      Self::finish_channel(channel.as_ref(), result, &helper).map(SecurityToken::SecurityContext)
    }
    .boxed()
  }

  fn renew_token(&self, timeout: Duration, token: &SecurityToken) -> SecurityResult<SecurityToken> {
    let current = expect_session_token(token)?;
    let standards = self.settings.standards;
    let key_size = validate_key_size(self.settings.key_size, self.settings.algorithm_suite)?;
    let entropy_mode = self.mode.entropy_mode();

    let mut rst = RequestSecurityToken::new(standards, RequestType::Renew);
    rst.set_context(UniqueId::new().to_string())?;
    rst.set_token_type(standards.secure_conversation_version().token_type())?;
    rst.set_key_size(key_size)?;
    rst.set_renew_target(Self::context_clause(current))?;
    let entropy = if entropy_mode.requires_client_entropy() {
      let entropy = random_nonce((key_size / 8) as usize);
      rst.set_requestor_entropy(entropy.clone())?;
      Some(entropy)
    } else {
      None
    };
    rst.make_read_only();

    let reply = self.session_request(
      timeout,
      standards.secure_conversation_version().rst_renew_action(),
      standards.secure_conversation_version().rstr_renew_action(),
      rst,
    )?;
    let rstr = match &reply.body {
      MessageBody::Rstr(rstr) => rstr,
      MessageBody::RstrCollection(collection) => {
        collection.find(|r| r.requested_security_token().is_some())?
      }
      _ => return Err(security_error!(Negotiation, "Unexpected renewal response body")),
    };
    let key = recover_key(entropy_mode, entropy.as_deref(), key_size, rstr, &standards)?;
    let renewed = token_from_response(rstr, key, current.authorization_policies().to_vec())?;
    if renewed.context_id() != current.context_id() {
      return Err(security_error!(
        Negotiation,
        "The renewed token belongs to context {} instead of {}",
        renewed.context_id(),
        current.context_id()
      ));
    }
    security_log!(
      "Security context {} renewed, key generation {:?}",
      renewed.context_id(),
      renewed.key_generation()
    );
    Ok(SecurityToken::SecurityContext(renewed))
  }

  fn cancel_token(&self, timeout: Duration, token: &SecurityToken) -> SecurityResult<()> {
    let current = expect_session_token(token)?;
    let standards = self.settings.standards;
    let mut rst = RequestSecurityToken::new(standards, RequestType::Cancel);
    rst.set_context(UniqueId::new().to_string())?;
    rst.set_cancel_target(Self::context_clause(current))?;
    rst.make_read_only();

    let reply = self.session_request(
      timeout,
      standards.secure_conversation_version().rst_cancel_action(),
      standards.secure_conversation_version().rstr_cancel_action(),
      rst,
    )?;
    match &reply.body {
      MessageBody::Rstr(rstr) if rstr.is_requested_token_cancelled() => {
        security_log!("Security context {} cancelled", current.context_id());
        Ok(())
      }
      _ => Err(security_error!(
        Negotiation,
        "The cancellation response does not confirm the cancellation"
      )),
    }
  }
}

impl CommunicationObject for NegotiationTokenProvider {
  fn open(&self, timeout: Duration) -> SecurityResult<()> {
    self.lifecycle.open_with(|| {
      let helper = TimeoutHelper::new(timeout);
      if self.channel_factory.state() == CommunicationState::Created {
        self.channel_factory.open(helper.check("open the channel factory")?)?;
      }
      if let Some(factory) = &self.session_channel_factory {
        if factory.state() == CommunicationState::Created {
          factory.open(helper.check("open the session channel factory")?)?;
        }
      }
      Ok(())
    })
  }

  fn close(&self, timeout: Duration) -> SecurityResult<()> {
    self.lifecycle.close_with(|| {
      let helper = TimeoutHelper::new(timeout);
      self.channel_factory.close(helper.remaining_time())?;
      if let Some(factory) = &self.session_channel_factory {
        factory.close(helper.remaining_time())?;
      }
      Ok(())
    })
  }

  fn abort(&self) {
    self.channel_factory.abort();
    if let Some(factory) = &self.session_channel_factory {
      factory.abort();
    }
    self.lifecycle.abort();
  }

  fn state(&self) -> CommunicationState {
    self.lifecycle.get()
  }
}
