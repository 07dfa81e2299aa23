use serde::{Deserialize, Serialize};

// Namespaces that do not change between the supported versions
pub const SOAP12_ENVELOPE_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSU_NAMESPACE: &str =
  "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const WSSE_NAMESPACE: &str =
  "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSSE11_NAMESPACE: &str =
  "http://docs.oasis-open.org/wss/oasis-wss-wssecurity-secext-1.1.xsd";
pub const XMLDSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XMLENC_NAMESPACE: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const X509_TOKEN_TYPE: &str =
  "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3";
pub const USERNAME_TOKEN_TYPE: &str =
  "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#UsernameToken";
pub const THUMBPRINT_VALUE_TYPE: &str =
  "http://docs.oasis-open.org/wss/oasis-wss-soap-message-security-1.1#ThumbprintSHA1";
pub const ENCRYPTED_KEY_SHA1_VALUE_TYPE: &str =
  "http://docs.oasis-open.org/wss/oasis-wss-soap-message-security-1.1#EncryptedKeySHA1";

/// Label used for derived keys when no explicit label is sent.
pub const DEFAULT_DERIVATION_LABEL: &str = "WS-SecureConversationWS-SecureConversation";
/// Label of the SSPI negotiation authenticator.
pub const AUTHENTICATOR_LABEL: &str = "AUTH-HASH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityVersion {
  WsSecurity10,
  WsSecurity11,
}

impl SecurityVersion {
  pub fn prefix(self) -> &'static str {
    "o"
  }

  pub fn namespace(self) -> &'static str {
    WSSE_NAMESPACE
  }

  pub fn supports_signature_confirmation(self) -> bool {
    self == SecurityVersion::WsSecurity11
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustVersion {
  WsTrustFeb2005,
  WsTrust13,
}

impl TrustVersion {
  pub fn prefix(self) -> &'static str {
    match self {
      TrustVersion::WsTrustFeb2005 => "t",
      TrustVersion::WsTrust13 => "trust",
    }
  }

  pub fn namespace(self) -> &'static str {
    match self {
      TrustVersion::WsTrustFeb2005 => "http://schemas.xmlsoap.org/ws/2005/02/trust",
      TrustVersion::WsTrust13 => "http://docs.oasis-open.org/ws-sx/ws-trust/200512",
    }
  }

  fn uri(self, suffix: &str) -> String {
    format!("{}/{}", self.namespace(), suffix)
  }

  pub fn request_type_issue(self) -> String {
    self.uri("Issue")
  }

  pub fn request_type_renew(self) -> String {
    self.uri("Renew")
  }

  pub fn request_type_cancel(self) -> String {
    self.uri("Cancel")
  }

  pub fn rst_issue_action(self) -> String {
    self.uri("RST/Issue")
  }

  pub fn rstr_issue_action(self) -> String {
    self.uri("RSTR/Issue")
  }

  /// Action of the last reply of a multi-leg negotiation.
  pub fn rstr_issue_final_action(self) -> String {
    match self {
      TrustVersion::WsTrustFeb2005 => self.rstr_issue_action(),
      TrustVersion::WsTrust13 => self.uri("RSTRC/IssueFinal"),
    }
  }

  pub fn spnego_value_type(self) -> String {
    self.uri("spnego")
  }

  pub fn tls_value_type(self) -> String {
    self.uri("tlsnego")
  }

  pub fn psha1_computed_key(self) -> String {
    self.uri("CK/PSHA1")
  }

  pub fn key_type_symmetric(self) -> String {
    self.uri("SymmetricKey")
  }

  pub fn binary_secret_type_nonce(self) -> String {
    self.uri("Nonce")
  }

  /// Whether a final issuance reply is wrapped in an RSTR collection.
  pub fn uses_response_collection(self) -> bool {
    self == TrustVersion::WsTrust13
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecureConversationVersion {
  WsSecureConversationFeb2005,
  WsSecureConversation13,
}

impl SecureConversationVersion {
  pub fn prefix(self) -> &'static str {
    "c"
  }

  pub fn namespace(self) -> &'static str {
    match self {
      SecureConversationVersion::WsSecureConversationFeb2005 => {
        "http://schemas.xmlsoap.org/ws/2005/02/sc"
      }
      SecureConversationVersion::WsSecureConversation13 => {
        "http://docs.oasis-open.org/ws-sx/ws-secureconversation/200512"
      }
    }
  }

  fn trust_base(self) -> &'static str {
    match self {
      SecureConversationVersion::WsSecureConversationFeb2005 => {
        "http://schemas.xmlsoap.org/ws/2005/02/trust"
      }
      SecureConversationVersion::WsSecureConversation13 => {
        "http://docs.oasis-open.org/ws-sx/ws-trust/200512"
      }
    }
  }

  pub fn token_type(self) -> String {
    format!("{}/sct", self.namespace())
  }

  pub fn derived_key_token_type(self) -> String {
    format!("{}/dk", self.namespace())
  }

  pub fn rst_issue_action(self) -> String {
    format!("{}/RST/SCT", self.trust_base())
  }

  pub fn rstr_issue_action(self) -> String {
    format!("{}/RSTR/SCT", self.trust_base())
  }

  pub fn rst_cancel_action(self) -> String {
    format!("{}/RST/SCT/Cancel", self.trust_base())
  }

  pub fn rstr_cancel_action(self) -> String {
    format!("{}/RSTR/SCT/Cancel", self.trust_base())
  }

  pub fn rst_renew_action(self) -> String {
    format!("{}/RST/SCT/Renew", self.trust_base())
  }

  pub fn rstr_renew_action(self) -> String {
    format!("{}/RSTR/SCT/Renew", self.trust_base())
  }
}

/// SOAP fault subcodes used by the security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultSubcode {
  // WS-Security
  InvalidSecurity,
  InvalidSecurityToken,
  FailedAuthentication,
  FailedCheck,
  SecurityTokenUnavailable,
  MessageExpired,
  // WS-SecureConversation
  BadContextToken,
  UnsupportedContextToken,
  RenewNeeded,
  // WS-Trust
  InvalidRequest,
  RequestFailed,
}

impl FaultSubcode {
  pub fn local_name(self) -> &'static str {
    match self {
      FaultSubcode::InvalidSecurity => "InvalidSecurity",
      FaultSubcode::InvalidSecurityToken => "InvalidSecurityToken",
      FaultSubcode::FailedAuthentication => "FailedAuthentication",
      FaultSubcode::FailedCheck => "FailedCheck",
      FaultSubcode::SecurityTokenUnavailable => "SecurityTokenUnavailable",
      FaultSubcode::MessageExpired => "MessageExpired",
      FaultSubcode::BadContextToken => "BadContextToken",
      FaultSubcode::UnsupportedContextToken => "UnsupportedContextToken",
      FaultSubcode::RenewNeeded => "RenewNeeded",
      FaultSubcode::InvalidRequest => "InvalidRequest",
      FaultSubcode::RequestFailed => "RequestFailed",
    }
  }

  pub fn from_local_name(name: &str) -> Option<Self> {
    [
      FaultSubcode::InvalidSecurity,
      FaultSubcode::InvalidSecurityToken,
      FaultSubcode::FailedAuthentication,
      FaultSubcode::FailedCheck,
      FaultSubcode::SecurityTokenUnavailable,
      FaultSubcode::MessageExpired,
      FaultSubcode::BadContextToken,
      FaultSubcode::UnsupportedContextToken,
      FaultSubcode::RenewNeeded,
      FaultSubcode::InvalidRequest,
      FaultSubcode::RequestFailed,
    ]
    .into_iter()
    .find(|s| s.local_name() == name)
  }
}

/// Selects the vocabulary (namespaces, actions, token types, fault codes)
/// of one combination of WS-Security, WS-Trust and WS-SecureConversation
/// versions. Constructed explicitly and handed to every component that reads
/// or writes wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityStandardsManager {
  security_version: SecurityVersion,
  trust_version: TrustVersion,
  secure_conversation_version: SecureConversationVersion,
}

impl SecurityStandardsManager {
  pub fn new(
    security_version: SecurityVersion,
    trust_version: TrustVersion,
    secure_conversation_version: SecureConversationVersion,
  ) -> Self {
    SecurityStandardsManager {
      security_version,
      trust_version,
      secure_conversation_version,
    }
  }

  /// WS-Security 1.0 with the February 2005 drafts of Trust and
  /// SecureConversation.
  pub fn feb2005() -> Self {
    Self::new(
      SecurityVersion::WsSecurity10,
      TrustVersion::WsTrustFeb2005,
      SecureConversationVersion::WsSecureConversationFeb2005,
    )
  }

  pub fn security_version(&self) -> SecurityVersion {
    self.security_version
  }

  pub fn trust_version(&self) -> TrustVersion {
    self.trust_version
  }

  pub fn secure_conversation_version(&self) -> SecureConversationVersion {
    self.secure_conversation_version
  }

  pub fn fault_subcode_namespace(&self, subcode: FaultSubcode) -> &'static str {
    match subcode {
      FaultSubcode::BadContextToken
      | FaultSubcode::UnsupportedContextToken
      | FaultSubcode::RenewNeeded => self.secure_conversation_version.namespace(),
      FaultSubcode::InvalidRequest | FaultSubcode::RequestFailed => {
        self.trust_version.namespace()
      }
      _ => self.security_version.namespace(),
    }
  }

  pub fn is_security_context_token_type(&self, token_type: &str) -> bool {
    token_type == self.secure_conversation_version.token_type()
  }
}

impl Default for SecurityStandardsManager {
  fn default() -> Self {
    Self::new(
      SecurityVersion::WsSecurity11,
      TrustVersion::WsTrust13,
      SecureConversationVersion::WsSecureConversation13,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn trust13_vocabulary() {
    let standards = SecurityStandardsManager::default();
    let trust = standards.trust_version();
    assert_eq!(
      trust.rst_issue_action(),
      "http://docs.oasis-open.org/ws-sx/ws-trust/200512/RST/Issue"
    );
    assert_eq!(
      trust.rstr_issue_final_action(),
      "http://docs.oasis-open.org/ws-sx/ws-trust/200512/RSTRC/IssueFinal"
    );
    assert!(standards.is_security_context_token_type(
      "http://docs.oasis-open.org/ws-sx/ws-secureconversation/200512/sct"
    ));
  }

  #[test]
  fn feb2005_vocabulary() {
    let standards = SecurityStandardsManager::feb2005();
    assert_eq!(
      standards.secure_conversation_version().rst_issue_action(),
      "http://schemas.xmlsoap.org/ws/2005/02/trust/RST/SCT"
    );
    assert_eq!(
      standards.trust_version().rstr_issue_final_action(),
      standards.trust_version().rstr_issue_action()
    );
    assert!(!standards.security_version().supports_signature_confirmation());
  }

  #[test]
  fn subcode_namespaces() {
    let standards = SecurityStandardsManager::default();
    assert_eq!(
      standards.fault_subcode_namespace(FaultSubcode::FailedAuthentication),
      WSSE_NAMESPACE
    );
    assert_eq!(
      standards.fault_subcode_namespace(FaultSubcode::BadContextToken),
      "http://docs.oasis-open.org/ws-sx/ws-secureconversation/200512"
    );
    assert_eq!(
      FaultSubcode::from_local_name("FailedAuthentication"),
      Some(FaultSubcode::FailedAuthentication)
    );
  }
}
