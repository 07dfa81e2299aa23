use serde::{Deserialize, Serialize};

use crate::security::{
  tokens::{key_identifier::KeyIdentifierClause, security_token::SecurityToken},
  SecurityResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityTokenKind {
  /// Session token issued by secure conversation
  SecureConversation,
  /// Session token issued by an SSPI negotiation
  Sspi,
  X509,
  UserName,
}

/// Whether the token itself is put in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityTokenInclusionMode {
  AlwaysToRecipient,
  AlwaysToInitiator,
  Once,
  Never,
}

/// How messages refer to the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityTokenReferenceStyle {
  /// By local id of the token element in the same message
  Internal,
  /// By an identifier that works without the token in the message
  External,
}

/// How a supporting token is attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityTokenAttachmentMode {
  Signed,
  /// Signed and encrypted, a.k.a. basic
  SignedEncrypted,
  Endorsing,
  SignedEndorsing,
}

impl SecurityTokenAttachmentMode {
  pub fn is_endorsing(self) -> bool {
    matches!(
      self,
      SecurityTokenAttachmentMode::Endorsing | SecurityTokenAttachmentMode::SignedEndorsing
    )
  }

  pub fn is_signed(self) -> bool {
    !matches!(self, SecurityTokenAttachmentMode::Endorsing)
  }
}

/// Requirements on one token used by a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityTokenParameters {
  pub kind: SecurityTokenKind,
  pub inclusion_mode: SecurityTokenInclusionMode,
  pub reference_style: SecurityTokenReferenceStyle,
  pub require_derived_keys: bool,
}

impl SecurityTokenParameters {
  pub fn new(kind: SecurityTokenKind) -> Self {
    let (inclusion_mode, reference_style, require_derived_keys) = match kind {
      SecurityTokenKind::SecureConversation | SecurityTokenKind::Sspi => (
        SecurityTokenInclusionMode::AlwaysToRecipient,
        SecurityTokenReferenceStyle::External,
        true,
      ),
      SecurityTokenKind::X509 => (
        SecurityTokenInclusionMode::AlwaysToRecipient,
        SecurityTokenReferenceStyle::External,
        false,
      ),
      SecurityTokenKind::UserName => (
        SecurityTokenInclusionMode::AlwaysToRecipient,
        SecurityTokenReferenceStyle::Internal,
        false,
      ),
    };
    SecurityTokenParameters {
      kind,
      inclusion_mode,
      reference_style,
      require_derived_keys,
    }
  }

  pub fn secure_conversation() -> Self {
    Self::new(SecurityTokenKind::SecureConversation)
  }

  pub fn sspi() -> Self {
    Self::new(SecurityTokenKind::Sspi)
  }

  pub fn x509() -> Self {
    Self::new(SecurityTokenKind::X509)
  }

  pub fn user_name() -> Self {
    Self::new(SecurityTokenKind::UserName)
  }

  pub fn with_derived_keys(mut self, require_derived_keys: bool) -> Self {
    self.require_derived_keys = require_derived_keys;
    self
  }

  pub fn with_inclusion_mode(mut self, inclusion_mode: SecurityTokenInclusionMode) -> Self {
    self.inclusion_mode = inclusion_mode;
    self
  }

  pub fn with_reference_style(mut self, reference_style: SecurityTokenReferenceStyle) -> Self {
    self.reference_style = reference_style;
    self
  }

  pub fn has_asymmetric_key(&self) -> bool {
    self.kind == SecurityTokenKind::X509
  }

  /// Whether a token of this kind may be derived from.
  pub fn supports_derived_keys(&self) -> bool {
    !matches!(self.kind, SecurityTokenKind::UserName | SecurityTokenKind::X509)
  }

  pub fn should_include_token(&self, at_initiator: bool) -> bool {
    match self.inclusion_mode {
      SecurityTokenInclusionMode::AlwaysToRecipient => at_initiator,
      SecurityTokenInclusionMode::AlwaysToInitiator => !at_initiator,
      SecurityTokenInclusionMode::Once => at_initiator,
      SecurityTokenInclusionMode::Never => false,
    }
  }

  pub fn matches_token_kind(&self, token: &SecurityToken) -> bool {
    match (self.kind, token.root_token()) {
      (
        SecurityTokenKind::SecureConversation | SecurityTokenKind::Sspi,
        SecurityToken::SecurityContext(_),
      ) => true,
      (SecurityTokenKind::X509, SecurityToken::X509(_)) => true,
      (SecurityTokenKind::UserName, SecurityToken::UserName(_)) => true,
      _ => false,
    }
  }

  /// Clause for `token`, using the external style when the token is not put
  /// in the message.
  pub fn create_key_identifier_clause(
    &self,
    token: &SecurityToken,
    token_included: bool,
  ) -> SecurityResult<KeyIdentifierClause> {
    let style = if token_included {
      self.reference_style
    } else {
      SecurityTokenReferenceStyle::External
    };
    token.create_key_identifier_clause(style)
  }

  /// Token-parameters-aware clause comparison: the token must be of this
  /// kind and match the clause.
  pub fn matches_key_identifier_clause(
    &self,
    token: &SecurityToken,
    clause: &KeyIdentifierClause,
    reference_style: SecurityTokenReferenceStyle,
  ) -> bool {
    if reference_style == SecurityTokenReferenceStyle::Internal && !clause.is_local_reference() {
      return false;
    }
    self.matches_token_kind(token) && token.matches_key_identifier_clause(clause)
  }
}

/// Supporting token requirement with its attachment mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportingTokenSpecification {
  pub parameters: SecurityTokenParameters,
  pub mode: SecurityTokenAttachmentMode,
}

impl SupportingTokenSpecification {
  pub fn new(parameters: SecurityTokenParameters, mode: SecurityTokenAttachmentMode) -> Self {
    SupportingTokenSpecification { parameters, mode }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_per_kind() {
    assert!(SecurityTokenParameters::secure_conversation().require_derived_keys);
    assert!(!SecurityTokenParameters::x509().require_derived_keys);
    assert!(SecurityTokenParameters::x509().has_asymmetric_key());
    assert!(!SecurityTokenParameters::sspi().has_asymmetric_key());
    assert_eq!(
      SecurityTokenParameters::user_name().reference_style,
      SecurityTokenReferenceStyle::Internal
    );
  }

  #[test]
  fn inclusion() {
    let p = SecurityTokenParameters::x509();
    assert!(p.should_include_token(true));
    assert!(!p.should_include_token(false));
    let never = p.with_inclusion_mode(SecurityTokenInclusionMode::Never);
    assert!(!never.should_include_token(true));
  }

  #[test]
  fn attachment_modes() {
    assert!(SecurityTokenAttachmentMode::SignedEndorsing.is_endorsing());
    assert!(SecurityTokenAttachmentMode::SignedEndorsing.is_signed());
    assert!(!SecurityTokenAttachmentMode::Endorsing.is_signed());
    assert!(!SecurityTokenAttachmentMode::SignedEncrypted.is_endorsing());
  }
}
