use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    cryptographic::{psha1::psha1, symmetric_key::SymmetricKey},
    message::xml_writer::{XmlWriter, XmlWriterExt},
    standards::{SecurityStandardsManager, WSU_NAMESPACE},
    types::UniqueId,
    SecurityResult,
  },
  security_error,
};

pub const POLICY_NAMESPACE: &str = "http://schemas.xmlsoap.org/ws/2004/09/policy";
pub const BASE64_ENCODING_TYPE: &str =
  "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
  Issue,
  Renew,
  Cancel,
}

impl RequestType {
  pub fn uri(self, standards: &SecurityStandardsManager) -> String {
    let trust = standards.trust_version();
    match self {
      RequestType::Issue => trust.request_type_issue(),
      RequestType::Renew => trust.request_type_renew(),
      RequestType::Cancel => trust.request_type_cancel(),
    }
  }

  pub fn from_uri(uri: &str, standards: &SecurityStandardsManager) -> Option<Self> {
    [RequestType::Issue, RequestType::Renew, RequestType::Cancel]
      .into_iter()
      .find(|t| t.uri(standards) == uri)
  }
}

/// Opaque negotiation blob (SPNEGO, TLS) carried in `BinaryExchange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryExchange {
  pub value_type: String,
  pub blob: Vec<u8>,
}

impl BinaryExchange {
  pub fn new(value_type: impl Into<String>, blob: Vec<u8>) -> Self {
    BinaryExchange {
      value_type: value_type.into(),
      blob,
    }
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let trust = standards.trust_version();
    writer.write_start_element(trust.prefix(), "BinaryExchange", trust.namespace());
    writer.write_attribute("", "ValueType", "", &self.value_type);
    writer.write_attribute("", "EncodingType", "", BASE64_ENCODING_TYPE);
    writer.write_base64(&self.blob);
    writer.write_end_element();
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
  pub created: DateTime<Utc>,
  pub expires: DateTime<Utc>,
}

impl Lifetime {
  pub fn new(created: DateTime<Utc>, expires: DateTime<Utc>) -> Self {
    Lifetime { created, expires }
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let trust = standards.trust_version();
    writer.write_start_element(trust.prefix(), "Lifetime", trust.namespace());
    writer.write_element_string("u", "Created", WSU_NAMESPACE, &format_time(self.created));
    writer.write_element_string("u", "Expires", WSU_NAMESPACE, &format_time(self.expires));
    writer.write_end_element();
  }
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
  t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Who contributes key material to an issued key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityKeyEntropyMode {
  ClientEntropy,
  ServerEntropy,
  #[default]
  CombinedEntropy,
}

impl SecurityKeyEntropyMode {
  pub fn requires_client_entropy(self) -> bool {
    self != SecurityKeyEntropyMode::ServerEntropy
  }

  pub fn requires_server_entropy(self) -> bool {
    self != SecurityKeyEntropyMode::ClientEntropy
  }
}

/// P_SHA1 combination of requestor and issuer entropy into a key of
/// `key_size_bits`.
pub fn compute_combined_key(
  requestor_entropy: &[u8],
  issuer_entropy: &[u8],
  key_size_bits: u32,
) -> SecurityResult<SymmetricKey> {
  if key_size_bits == 0 || key_size_bits % 8 != 0 {
    return Err(security_error!(
      Argument,
      "Key size {key_size_bits} is not a positive multiple of 8"
    ));
  }
  if requestor_entropy.is_empty() || issuer_entropy.is_empty() {
    return Err(security_error!(
      Negotiation,
      "Combined entropy requires both requestor and issuer entropy"
    ));
  }
  let bytes = psha1(
    requestor_entropy,
    issuer_entropy,
    0,
    (key_size_bits / 8) as usize,
  );
  Ok(SymmetricKey::from_bytes(&bytes))
}

/// The security context token as carried in `RequestedSecurityToken`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedSecurityToken {
  pub id: String,
  pub context_id: UniqueId,
  pub generation: Option<UniqueId>,
}

impl RequestedSecurityToken {
  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let trust = standards.trust_version();
    let sc = standards.secure_conversation_version();
    writer.write_start_element(trust.prefix(), "RequestedSecurityToken", trust.namespace());
    writer.write_start_element(sc.prefix(), "SecurityContextToken", sc.namespace());
    writer.write_wsu_id(&self.id);
    writer.write_element_string(sc.prefix(), "Identifier", sc.namespace(), self.context_id.as_str());
    if let Some(generation) = &self.generation {
      writer.write_element_string(sc.prefix(), "Instance", sc.namespace(), generation.as_str());
    }
    writer.write_end_element();
    writer.write_end_element();
  }
}

/// How the proof key reaches the requestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedProofToken {
  /// Proof key wrapped with the key established by the negotiation
  EncryptedKey {
    wrap_algorithm: String,
    wrapped_key: Vec<u8>,
  },
  /// Key computed from both entropies with the given algorithm URI
  ComputedKey(String),
  /// Proof key in the clear; only over an already protected exchange
  BinarySecret(Vec<u8>),
}

impl RequestedProofToken {
  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let trust = standards.trust_version();
    writer.write_start_element(trust.prefix(), "RequestedProofToken", trust.namespace());
    match self {
      RequestedProofToken::EncryptedKey {
        wrap_algorithm,
        wrapped_key,
      } => {
        let xenc = crate::security::standards::XMLENC_NAMESPACE;
        writer.write_start_element("e", "EncryptedKey", xenc);
        writer.write_start_element("e", "EncryptionMethod", xenc);
        writer.write_attribute("", "Algorithm", "", wrap_algorithm);
        writer.write_end_element();
        writer.write_start_element("e", "CipherData", xenc);
        writer.write_element_base64("e", "CipherValue", xenc, wrapped_key);
        writer.write_end_element();
        writer.write_end_element();
      }
      RequestedProofToken::ComputedKey(uri) => {
        writer.write_element_string(trust.prefix(), "ComputedKey", trust.namespace(), uri);
      }
      RequestedProofToken::BinarySecret(secret) => {
        write_binary_secret(writer, standards, secret);
      }
    }
    writer.write_end_element();
  }
}

pub(crate) fn write_binary_secret(
  writer: &mut dyn XmlWriter,
  standards: &SecurityStandardsManager,
  secret: &[u8],
) {
  let trust = standards.trust_version();
  writer.write_start_element(trust.prefix(), "BinarySecret", trust.namespace());
  writer.write_attribute("", "Type", "", &trust.binary_secret_type_nonce());
  writer.write_base64(secret);
  writer.write_end_element();
}

pub(crate) fn write_entropy(
  writer: &mut dyn XmlWriter,
  standards: &SecurityStandardsManager,
  entropy: &[u8],
) {
  let trust = standards.trust_version();
  writer.write_start_element(trust.prefix(), "Entropy", trust.namespace());
  write_binary_secret(writer, standards, entropy);
  writer.write_end_element();
}

pub(crate) fn write_applies_to(writer: &mut dyn XmlWriter, address: &str) {
  use crate::security::message::envelope::ADDRESSING_NAMESPACE;
  writer.write_start_element("wsp", "AppliesTo", POLICY_NAMESPACE);
  writer.write_start_element("a", "EndpointReference", ADDRESSING_NAMESPACE);
  writer.write_element_string("a", "Address", ADDRESSING_NAMESPACE, address);
  writer.write_end_element();
  writer.write_end_element();
}

/// Canonical form frozen by `make_read_only`. Once present, the owning
/// message serializes to exactly these bytes and refuses changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FrozenBytes(Option<Vec<u8>>);

impl FrozenBytes {
  pub fn is_frozen(&self) -> bool {
    self.0.is_some()
  }

  pub fn freeze(&mut self, bytes: Vec<u8>) {
    if self.0.is_none() {
      self.0 = Some(bytes);
    }
  }

  pub fn get(&self) -> Option<&[u8]> {
    self.0.as_deref()
  }

  pub fn ensure_writable(&self, what: &str) -> SecurityResult<()> {
    if self.is_frozen() {
      Err(security_error!(
        InvalidOperation,
        "The {what} is read-only and cannot be modified"
      ))
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn combined_key_depends_on_both_entropies() {
    let k1 = compute_combined_key(b"client-entropy", b"server-entropy", 256).unwrap();
    let k2 = compute_combined_key(b"client-entropy", b"other-entropy!", 256).unwrap();
    assert_eq!(k1.len(), 32);
    assert_ne!(k1.as_bytes(), k2.as_bytes());
    assert!(compute_combined_key(b"", b"server", 256).is_err());
    assert!(compute_combined_key(b"client", b"server", 12).is_err());
  }

  #[test]
  fn request_type_uris() {
    let standards = SecurityStandardsManager::default();
    let uri = RequestType::Cancel.uri(&standards);
    assert_eq!(RequestType::from_uri(&uri, &standards), Some(RequestType::Cancel));
    assert_eq!(RequestType::from_uri("urn:other", &standards), None);
  }
}
