use std::{sync::Arc, time::Duration};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
  security::{
    algorithm_suite::SecurityAlgorithmSuite,
    cache::NonceCache,
    config::{
      LocalClientSecuritySettings, LocalServiceSecuritySettings, DEFAULT_MAX_CLOCK_SKEW,
      DEFAULT_REPLAY_CACHE_SIZE, DEFAULT_REPLAY_WINDOW, DEFAULT_TIMESTAMP_VALIDITY_DURATION,
    },
    protocol::{
      asymmetric::AsymmetricSecurityProtocol,
      protection_requirements::{ChannelProtectionRequirements, MessagePartSpecification, WILDCARD_ACTION},
      symmetric::SymmetricSecurityProtocol,
      transport::TransportSecurityProtocol,
      SecurityProtocol,
    },
    standards::SecurityStandardsManager,
    tokens::{
      SecurityToken, SecurityTokenAuthenticator, SecurityTokenProvider, SecurityTokenResolver,
      SupportingTokenSpecification,
    },
    SecurityResult,
  },
  security_error,
};

/// Order in which signing and encryption are applied to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageProtectionOrder {
  #[default]
  SignBeforeEncrypt,
  /// Sign, encrypt, then encrypt the signature too
  SignBeforeEncryptAndEncryptSignature,
  EncryptBeforeSign,
}

impl MessageProtectionOrder {
  /// The order actually used for a message. Encrypting the signature only
  /// makes sense when the body is encrypted.
  pub fn effective(self, body_encrypted: bool) -> Self {
    match self {
      MessageProtectionOrder::SignBeforeEncryptAndEncryptSignature if !body_encrypted => {
        MessageProtectionOrder::SignBeforeEncrypt
      }
      order => order,
    }
  }

  pub fn is_sign_before_encrypt(self) -> bool {
    self != MessageProtectionOrder::EncryptBeforeSign
  }

  pub fn encrypts_signature(self) -> bool {
    self == MessageProtectionOrder::SignBeforeEncryptAndEncryptSignature
  }
}

/// Element order in `<wsse:Security>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityHeaderLayout {
  /// Every token is declared before it is used
  #[default]
  Strict,
  Lax,
  LaxTimestampFirst,
  LaxTimestampLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProtocolRole {
  Initiator,
  Recipient,
}

impl SecurityProtocolRole {
  pub fn is_initiator(self) -> bool {
    self == SecurityProtocolRole::Initiator
  }
}

/// Which tokens protect messages.
#[derive(Debug, Clone)]
pub enum SecurityProtocolBinding {
  /// One token signs and encrypts in both directions.
  Symmetric {
    protection_token_parameters: crate::security::tokens::SecurityTokenParameters,
  },
  /// Each side signs with its own token and encrypts for the other.
  Asymmetric {
    initiator_token_parameters: crate::security::tokens::SecurityTokenParameters,
    recipient_token_parameters: crate::security::tokens::SecurityTokenParameters,
  },
  /// The transport protects the message; only a timestamp and supporting
  /// tokens go into the header.
  Transport,
}

/// Supporting token requirement plus where the initiator gets the token.
#[derive(Clone)]
pub struct SupportingTokenProviderSpecification {
  pub specification: SupportingTokenSpecification,
  pub provider: Arc<dyn SecurityTokenProvider>,
}

/// Supporting token requirement plus how the recipient validates the token.
#[derive(Clone)]
pub struct SupportingTokenAuthenticatorSpecification {
  pub specification: SupportingTokenSpecification,
  pub authenticator: Arc<dyn SecurityTokenAuthenticator>,
}

/// Per-endpoint message security configuration. Built once through
/// [`SecurityProtocolFactoryBuilder`] and immutable afterwards; protocol
/// instances share it.
pub struct SecurityProtocolFactory {
  standards: SecurityStandardsManager,
  algorithm_suite: SecurityAlgorithmSuite,
  binding: SecurityProtocolBinding,
  protection_order: MessageProtectionOrder,
  layout: SecurityHeaderLayout,
  include_timestamp: bool,
  require_signature_confirmation: bool,
  detect_replays: bool,
  max_clock_skew: Duration,
  replay_window: Duration,
  timestamp_validity_duration: Duration,
  nonce_cache: Option<Arc<NonceCache>>,
  protection_requirements: ChannelProtectionRequirements,
  token_provider: Option<Arc<dyn SecurityTokenProvider>>,
  recipient_token_provider: Option<Arc<dyn SecurityTokenProvider>>,
  token_authenticator: Option<Arc<dyn SecurityTokenAuthenticator>>,
  recipient_token: Option<SecurityToken>,
  out_of_band_resolvers: Vec<Arc<dyn SecurityTokenResolver>>,
  supporting_token_providers: Vec<(Option<String>, SupportingTokenProviderSpecification)>,
  supporting_token_authenticators: Vec<(Option<String>, SupportingTokenAuthenticatorSpecification)>,
}

fn applies_to(scope: &Option<String>, action: &str) -> bool {
  match scope {
    None => true,
    Some(a) => a == action || a == WILDCARD_ACTION,
  }
}

impl SecurityProtocolFactory {
  pub fn standards(&self) -> &SecurityStandardsManager {
    &self.standards
  }

  pub fn algorithm_suite(&self) -> SecurityAlgorithmSuite {
    self.algorithm_suite
  }

  pub fn binding(&self) -> &SecurityProtocolBinding {
    &self.binding
  }

  pub fn protection_order(&self) -> MessageProtectionOrder {
    self.protection_order
  }

  pub fn layout(&self) -> SecurityHeaderLayout {
    self.layout
  }

  pub fn include_timestamp(&self) -> bool {
    self.include_timestamp
  }

  pub fn require_signature_confirmation(&self) -> bool {
    self.require_signature_confirmation
  }

  pub fn detect_replays(&self) -> bool {
    self.detect_replays
  }

  pub fn max_clock_skew(&self) -> Duration {
    self.max_clock_skew
  }

  pub fn replay_window(&self) -> Duration {
    self.replay_window
  }

  pub fn timestamp_validity_duration(&self) -> Duration {
    self.timestamp_validity_duration
  }

  pub fn nonce_cache(&self) -> Option<&Arc<NonceCache>> {
    self.nonce_cache.as_ref()
  }

  pub fn protection_requirements(&self) -> &ChannelProtectionRequirements {
    &self.protection_requirements
  }

  /// Signature and encryption parts for a message of `action`.
  pub fn message_parts(
    &self,
    action: &str,
    outgoing: bool,
  ) -> (MessagePartSpecification, MessagePartSpecification) {
    self.protection_requirements.parts_for(action, outgoing)
  }

  pub fn token_provider(&self) -> Option<&Arc<dyn SecurityTokenProvider>> {
    self.token_provider.as_ref()
  }

  pub fn recipient_token_provider(&self) -> Option<&Arc<dyn SecurityTokenProvider>> {
    self.recipient_token_provider.as_ref()
  }

  pub fn token_authenticator(&self) -> Option<&Arc<dyn SecurityTokenAuthenticator>> {
    self.token_authenticator.as_ref()
  }

  pub fn recipient_token(&self) -> Option<&SecurityToken> {
    self.recipient_token.as_ref()
  }

  pub fn out_of_band_resolvers(&self) -> &[Arc<dyn SecurityTokenResolver>] {
    &self.out_of_band_resolvers
  }

  pub fn supporting_token_providers(&self, action: &str) -> Vec<&SupportingTokenProviderSpecification> {
    self
      .supporting_token_providers
      .iter()
      .filter(|(scope, _)| applies_to(scope, action))
      .map(|(_, spec)| spec)
      .collect()
  }

  pub fn supporting_token_authenticators(
    &self,
    action: &str,
  ) -> Vec<&SupportingTokenAuthenticatorSpecification> {
    self
      .supporting_token_authenticators
      .iter()
      .filter(|(scope, _)| applies_to(scope, action))
      .map(|(_, spec)| spec)
      .collect()
  }

  /// Derived keys one message may ask for: primary signature and
  /// encryption, plus one per endorsing supporting token that derives, with
  /// a factor of two of headroom.
  pub fn max_derived_keys(&self, action: &str) -> usize {
    let deriving_supporting = self
      .supporting_token_authenticators(action)
      .into_iter()
      .filter(|s| {
        let p = &s.specification.parameters;
        p.require_derived_keys && !p.has_asymmetric_key() && s.specification.mode.is_endorsing()
      })
      .count();
    (1 + 1 + deriving_supporting) * 2
  }

  /// Protocol instance for one end of a channel.
  pub fn create_protocol(
    self: &Arc<Self>,
    role: SecurityProtocolRole,
  ) -> SecurityResult<Arc<dyn SecurityProtocol>> {
    let protocol: Arc<dyn SecurityProtocol> = match &self.binding {
      SecurityProtocolBinding::Symmetric { .. } => {
        Arc::new(SymmetricSecurityProtocol::new(self.clone(), role)?)
      }
      SecurityProtocolBinding::Asymmetric { .. } => {
        Arc::new(AsymmetricSecurityProtocol::new(self.clone(), role)?)
      }
      SecurityProtocolBinding::Transport => {
        Arc::new(TransportSecurityProtocol::new(self.clone(), role)?)
      }
    };
    debug!("Created {role:?} security protocol for {:?} binding", self.binding_name());
    Ok(protocol)
  }

  fn binding_name(&self) -> &'static str {
    match self.binding {
      SecurityProtocolBinding::Symmetric { .. } => "symmetric",
      SecurityProtocolBinding::Asymmetric { .. } => "asymmetric",
      SecurityProtocolBinding::Transport => "transport",
    }
  }
}

/// Mutable configuration stage of a [`SecurityProtocolFactory`].
pub struct SecurityProtocolFactoryBuilder {
  factory: SecurityProtocolFactory,
  replay_cache_size: usize,
}

impl SecurityProtocolFactoryBuilder {
  pub fn new(binding: SecurityProtocolBinding) -> Self {
    SecurityProtocolFactoryBuilder {
      factory: SecurityProtocolFactory {
        standards: SecurityStandardsManager::default(),
        algorithm_suite: SecurityAlgorithmSuite::default(),
        binding,
        protection_order: MessageProtectionOrder::default(),
        layout: SecurityHeaderLayout::default(),
        include_timestamp: true,
        require_signature_confirmation: false,
        detect_replays: false,
        max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
        replay_window: DEFAULT_REPLAY_WINDOW,
        timestamp_validity_duration: DEFAULT_TIMESTAMP_VALIDITY_DURATION,
        nonce_cache: None,
        protection_requirements: ChannelProtectionRequirements::default(),
        token_provider: None,
        recipient_token_provider: None,
        token_authenticator: None,
        recipient_token: None,
        out_of_band_resolvers: Vec::new(),
        supporting_token_providers: Vec::new(),
        supporting_token_authenticators: Vec::new(),
      },
      replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
    }
  }

  pub fn standards(mut self, standards: SecurityStandardsManager) -> Self {
    self.factory.standards = standards;
    self
  }

  pub fn algorithm_suite(mut self, suite: SecurityAlgorithmSuite) -> Self {
    self.factory.algorithm_suite = suite;
    self
  }

  pub fn protection_order(mut self, order: MessageProtectionOrder) -> Self {
    self.factory.protection_order = order;
    self
  }

  pub fn layout(mut self, layout: SecurityHeaderLayout) -> Self {
    self.factory.layout = layout;
    self
  }

  pub fn include_timestamp(mut self, include: bool) -> Self {
    self.factory.include_timestamp = include;
    self
  }

  pub fn require_signature_confirmation(mut self, require: bool) -> Self {
    self.factory.require_signature_confirmation = require;
    self
  }

  pub fn detect_replays(mut self, detect: bool) -> Self {
    self.factory.detect_replays = detect;
    self
  }

  pub fn protection_requirements(mut self, requirements: ChannelProtectionRequirements) -> Self {
    self.factory.protection_requirements = requirements;
    self
  }

  /// Replay, skew and timestamp settings of a service endpoint.
  pub fn service_settings(mut self, settings: &LocalServiceSecuritySettings) -> Self {
    self.factory.detect_replays = settings.detect_replays;
    self.factory.max_clock_skew = settings.max_clock_skew;
    self.factory.replay_window = settings.replay_window;
    self.factory.timestamp_validity_duration = settings.timestamp_validity_duration;
    self.replay_cache_size = settings.replay_cache_size;
    self
  }

  pub fn client_settings(mut self, settings: &LocalClientSecuritySettings) -> Self {
    self.factory.detect_replays = settings.detect_replays;
    self.factory.max_clock_skew = settings.max_clock_skew;
    self.factory.replay_window = settings.replay_window;
    self.factory.timestamp_validity_duration = settings.timestamp_validity_duration;
    self.replay_cache_size = settings.replay_cache_size;
    self
  }

  /// Initiator: source of the primary token (symmetric: the protection
  /// token; asymmetric: the initiator's own certificate).
  pub fn token_provider(mut self, provider: Arc<dyn SecurityTokenProvider>) -> Self {
    self.factory.token_provider = Some(provider);
    self
  }

  /// Initiator, asymmetric binding: source of the recipient certificate.
  pub fn recipient_token_provider(mut self, provider: Arc<dyn SecurityTokenProvider>) -> Self {
    self.factory.recipient_token_provider = Some(provider);
    self
  }

  /// Recipient: validates the token the initiator signed with.
  pub fn token_authenticator(mut self, authenticator: Arc<dyn SecurityTokenAuthenticator>) -> Self {
    self.factory.token_authenticator = Some(authenticator);
    self
  }

  /// Recipient: its own certificate, with the private key.
  pub fn recipient_token(mut self, token: SecurityToken) -> Self {
    self.factory.recipient_token = Some(token);
    self
  }

  pub fn out_of_band_resolver(mut self, resolver: Arc<dyn SecurityTokenResolver>) -> Self {
    self.factory.out_of_band_resolvers.push(resolver);
    self
  }

  /// Supporting token for every action (`action` None) or one action.
  pub fn supporting_token_provider(
    mut self,
    action: Option<String>,
    specification: SupportingTokenProviderSpecification,
  ) -> Self {
    self
      .factory
      .supporting_token_providers
      .push((action, specification));
    self
  }

  pub fn supporting_token_authenticator(
    mut self,
    action: Option<String>,
    specification: SupportingTokenAuthenticatorSpecification,
  ) -> Self {
    self
      .factory
      .supporting_token_authenticators
      .push((action, specification));
    self
  }

  pub fn build(self) -> SecurityResult<Arc<SecurityProtocolFactory>> {
    let SecurityProtocolFactoryBuilder {
      mut factory,
      replay_cache_size,
    } = self;

    if factory.require_signature_confirmation
      && !factory
        .standards
        .security_version()
        .supports_signature_confirmation()
    {
      return Err(security_error!(
        Argument,
        "Signature confirmation needs WS-Security 1.1"
      ));
    }
    if factory.detect_replays {
      if !factory.include_timestamp {
        return Err(security_error!(
          Argument,
          "Replay detection needs timestamps in the security header"
        ));
      }
      factory.nonce_cache = Some(Arc::new(NonceCache::new(
        replay_cache_size,
        factory.replay_window + factory.max_clock_skew,
      )));
    }
    for (_, spec) in &factory.supporting_token_providers {
      check_supporting_token_kind(&factory.binding, &spec.specification)?;
    }
    for (_, spec) in &factory.supporting_token_authenticators {
      check_supporting_token_kind(&factory.binding, &spec.specification)?;
    }
    factory.protection_requirements.make_read_only();
    Ok(Arc::new(factory))
  }
}

// Without message-level signing a supporting token can only be carried, not
// endorse anything but the timestamp.
fn check_supporting_token_kind(
  binding: &SecurityProtocolBinding,
  specification: &SupportingTokenSpecification,
) -> SecurityResult<()> {
  if matches!(binding, SecurityProtocolBinding::Transport)
    && specification.mode == crate::security::tokens::SecurityTokenAttachmentMode::SignedEncrypted
  {
    return Err(security_error!(
      Argument,
      "Signed and encrypted supporting tokens need message-level protection"
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security::{
    standards::{SecureConversationVersion, SecurityVersion, TrustVersion},
    tokens::{SecurityTokenAttachmentMode, SecurityTokenParameters},
  };

  fn symmetric() -> SecurityProtocolBinding {
    SecurityProtocolBinding::Symmetric {
      protection_token_parameters: SecurityTokenParameters::secure_conversation(),
    }
  }

  #[test]
  fn encrypted_signature_needs_an_encrypted_body() {
    let order = MessageProtectionOrder::SignBeforeEncryptAndEncryptSignature;
    assert_eq!(order.effective(true), order);
    assert_eq!(order.effective(false), MessageProtectionOrder::SignBeforeEncrypt);
    assert_eq!(
      MessageProtectionOrder::EncryptBeforeSign.effective(false),
      MessageProtectionOrder::EncryptBeforeSign
    );
  }

  #[test]
  fn replay_detection_creates_a_nonce_cache() {
    let factory = SecurityProtocolFactoryBuilder::new(symmetric())
      .service_settings(&LocalServiceSecuritySettings::default())
      .build()
      .unwrap();
    assert!(factory.detect_replays());
    assert!(factory.nonce_cache().is_some());
    assert!(factory.protection_requirements().is_read_only());

    assert!(SecurityProtocolFactoryBuilder::new(symmetric())
      .detect_replays(true)
      .include_timestamp(false)
      .build()
      .is_err());
  }

  #[test]
  fn signature_confirmation_needs_wss11() {
    let wss10 = SecurityStandardsManager::new(
      SecurityVersion::WsSecurity10,
      TrustVersion::WsTrust13,
      SecureConversationVersion::WsSecureConversation13,
    );
    assert!(SecurityProtocolFactoryBuilder::new(symmetric())
      .standards(wss10)
      .require_signature_confirmation(true)
      .build()
      .is_err());
  }

  #[test]
  fn derived_key_quota_counts_deriving_endorsing_tokens() {
    use crate::security::tokens::provider::SecurityContextTokenAuthenticator;
    let cache = Arc::new(crate::security::cache::SecurityContextTokenCache::new(
      Default::default(),
    ));
    let spec = SupportingTokenAuthenticatorSpecification {
      specification: SupportingTokenSpecification::new(
        SecurityTokenParameters::secure_conversation(),
        SecurityTokenAttachmentMode::Endorsing,
      ),
      authenticator: Arc::new(SecurityContextTokenAuthenticator::new(cache)),
    };
    let factory = SecurityProtocolFactoryBuilder::new(symmetric())
      .supporting_token_authenticator(Some("urn:a".to_string()), spec)
      .build()
      .unwrap();
    assert_eq!(factory.max_derived_keys("urn:a"), 6);
    assert_eq!(factory.max_derived_keys("urn:b"), 4);
  }
}
