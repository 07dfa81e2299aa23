use speedy::{Readable, Writable};

use crate::security::{
  message::xml_writer::{XmlWriter, XmlWriterExt},
  standards::{
    SecurityStandardsManager, ENCRYPTED_KEY_SHA1_VALUE_TYPE, THUMBPRINT_VALUE_TYPE, X509_TOKEN_TYPE,
    XMLDSIG_NAMESPACE, XMLENC_NAMESPACE,
  },
  types::UniqueId,
};

/// Reference to the key that wraps an encrypted key.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub enum WrappingKeyReference {
  LocalId(String),
  SecurityContext {
    context_id: UniqueId,
    generation: Option<UniqueId>,
  },
  Thumbprint(Vec<u8>),
  X509RawData(Vec<u8>),
}

impl WrappingKeyReference {
  pub fn to_clause(&self) -> KeyIdentifierClause {
    KeyIdentifierClause::new(match self {
      WrappingKeyReference::LocalId(id) => KeyIdentifier::LocalId(id.clone()),
      WrappingKeyReference::SecurityContext {
        context_id,
        generation,
      } => KeyIdentifier::SecurityContext {
        context_id: context_id.clone(),
        generation: generation.clone(),
      },
      WrappingKeyReference::Thumbprint(t) => KeyIdentifier::Thumbprint(t.clone()),
      WrappingKeyReference::X509RawData(d) => KeyIdentifier::X509RawData(d.clone()),
    })
  }

  /// None for clauses that cannot name a wrapping key.
  pub fn from_clause(clause: &KeyIdentifierClause) -> Option<Self> {
    match clause.identifier() {
      KeyIdentifier::LocalId(id) => Some(WrappingKeyReference::LocalId(id.clone())),
      KeyIdentifier::SecurityContext {
        context_id,
        generation,
      } => Some(WrappingKeyReference::SecurityContext {
        context_id: context_id.clone(),
        generation: generation.clone(),
      }),
      KeyIdentifier::Thumbprint(t) => Some(WrappingKeyReference::Thumbprint(t.clone())),
      KeyIdentifier::X509RawData(d) => Some(WrappingKeyReference::X509RawData(d.clone())),
      KeyIdentifier::EncryptedKeyHash(_) | KeyIdentifier::EncryptedKey { .. } => None,
    }
  }
}

/// The ways a message can point at a key or token.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub enum KeyIdentifier {
  /// wsu:Id of a token in the same message
  LocalId(String),
  /// Security context token, by context id and optional key generation
  SecurityContext {
    context_id: UniqueId,
    generation: Option<UniqueId>,
  },
  /// SHA-1 thumbprint of an X.509-style token
  Thumbprint(Vec<u8>),
  /// The X.509 token data itself. This is an intrinsic clause: the token can
  /// be constructed from the clause alone.
  X509RawData(Vec<u8>),
  /// SHA-1 of a previously exchanged encrypted key
  EncryptedKeyHash(Vec<u8>),
  /// An encrypted key carried inline, wrapped by another key
  EncryptedKey {
    wrapped_key: Vec<u8>,
    wrap_algorithm: String,
    wrapping: WrappingKeyReference,
  },
}

/// Key identifier plus optional implicit key derivation parameters
/// (WS-SecureConversation February 2005 style `wsc:Nonce`/`wsc:Length` on a
/// reference).
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct KeyIdentifierClause {
  identifier: KeyIdentifier,
  derivation_nonce: Option<Vec<u8>>,
  derivation_length: Option<u32>,
}

impl KeyIdentifierClause {
  pub fn new(identifier: KeyIdentifier) -> Self {
    KeyIdentifierClause {
      identifier,
      derivation_nonce: None,
      derivation_length: None,
    }
  }

  pub fn local_id(id: impl Into<String>) -> Self {
    Self::new(KeyIdentifier::LocalId(id.into()))
  }

  pub fn security_context(context_id: UniqueId, generation: Option<UniqueId>) -> Self {
    Self::new(KeyIdentifier::SecurityContext {
      context_id,
      generation,
    })
  }

  pub fn thumbprint(thumbprint: Vec<u8>) -> Self {
    Self::new(KeyIdentifier::Thumbprint(thumbprint))
  }

  pub fn x509_raw_data(raw_data: Vec<u8>) -> Self {
    Self::new(KeyIdentifier::X509RawData(raw_data))
  }

  pub fn encrypted_key_hash(hash: Vec<u8>) -> Self {
    Self::new(KeyIdentifier::EncryptedKeyHash(hash))
  }

  pub fn encrypted_key(
    wrapped_key: Vec<u8>,
    wrap_algorithm: impl Into<String>,
    wrapping: WrappingKeyReference,
  ) -> Self {
    Self::new(KeyIdentifier::EncryptedKey {
      wrapped_key,
      wrap_algorithm: wrap_algorithm.into(),
      wrapping,
    })
  }

  pub fn with_derivation(mut self, nonce: Vec<u8>, length: Option<u32>) -> Self {
    self.derivation_nonce = Some(nonce);
    self.derivation_length = length;
    self
  }

  pub fn identifier(&self) -> &KeyIdentifier {
    &self.identifier
  }

  pub fn derivation_nonce(&self) -> Option<&[u8]> {
    self.derivation_nonce.as_deref()
  }

  pub fn derivation_length(&self) -> Option<u32> {
    self.derivation_length
  }

  pub fn is_intrinsic(&self) -> bool {
    matches!(self.identifier, KeyIdentifier::X509RawData(_))
  }

  pub fn is_local_reference(&self) -> bool {
    matches!(self.identifier, KeyIdentifier::LocalId(_))
  }

  /// Same key identifier, derivation parameters ignored.
  pub fn matches(&self, other: &KeyIdentifierClause) -> bool {
    self.identifier == other.identifier
  }

  /// Context id named by this clause, looking through encrypted-key wrapping.
  pub fn security_context_id(&self) -> Option<&UniqueId> {
    match &self.identifier {
      KeyIdentifier::SecurityContext { context_id, .. } => Some(context_id),
      KeyIdentifier::EncryptedKey {
        wrapping: WrappingKeyReference::SecurityContext { context_id, .. },
        ..
      } => Some(context_id),
      _ => None,
    }
  }

  /// Writes the clause as a `wsse:SecurityTokenReference` (or, for inline
  /// encrypted keys, an `xenc:EncryptedKey`).
  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let wsse = standards.security_version().namespace();
    let wsc = standards.secure_conversation_version().namespace();
    if let KeyIdentifier::EncryptedKey {
      wrapped_key,
      wrap_algorithm,
      wrapping,
    } = &self.identifier
    {
      writer.write_start_element("e", "EncryptedKey", XMLENC_NAMESPACE);
      writer.write_start_element("e", "EncryptionMethod", XMLENC_NAMESPACE);
      writer.write_attribute("", "Algorithm", "", wrap_algorithm);
      writer.write_end_element();
      writer.write_start_element("", "KeyInfo", XMLDSIG_NAMESPACE);
      wrapping.to_clause().write_to(writer, standards);
      writer.write_end_element();
      writer.write_start_element("e", "CipherData", XMLENC_NAMESPACE);
      writer.write_element_base64("e", "CipherValue", XMLENC_NAMESPACE, wrapped_key);
      writer.write_end_element();
      writer.write_end_element();
      return;
    }

    writer.write_start_element("o", "SecurityTokenReference", wsse);
    match &self.identifier {
      KeyIdentifier::LocalId(id) => {
        writer.write_start_element("o", "Reference", wsse);
        writer.write_attribute("", "URI", "", &format!("#{id}"));
        writer.write_end_element();
      }
      KeyIdentifier::SecurityContext {
        context_id,
        generation,
      } => {
        writer.write_start_element("o", "Reference", wsse);
        writer.write_attribute("", "URI", "", context_id.as_str());
        writer.write_attribute(
          "",
          "ValueType",
          "",
          &standards.secure_conversation_version().token_type(),
        );
        if let Some(generation) = generation {
          writer.write_attribute("c", "Instance", wsc, generation.as_str());
        }
        writer.write_end_element();
      }
      KeyIdentifier::Thumbprint(t) => {
        writer.write_start_element("o", "KeyIdentifier", wsse);
        writer.write_attribute("", "ValueType", "", THUMBPRINT_VALUE_TYPE);
        writer.write_base64(t);
        writer.write_end_element();
      }
      KeyIdentifier::X509RawData(d) => {
        writer.write_start_element("o", "Embedded", wsse);
        writer.write_start_element("o", "BinarySecurityToken", wsse);
        writer.write_attribute("", "ValueType", "", X509_TOKEN_TYPE);
        writer.write_base64(d);
        writer.write_end_element();
        writer.write_end_element();
      }
      KeyIdentifier::EncryptedKeyHash(h) => {
        writer.write_start_element("o", "KeyIdentifier", wsse);
        writer.write_attribute("", "ValueType", "", ENCRYPTED_KEY_SHA1_VALUE_TYPE);
        writer.write_base64(h);
        writer.write_end_element();
      }
      KeyIdentifier::EncryptedKey { .. } => {} // handled above
    }
    if let Some(nonce) = &self.derivation_nonce {
      writer.write_element_base64("c", "Nonce", wsc, nonce);
      if let Some(length) = self.derivation_length {
        writer.write_element_string("c", "Length", wsc, &length.to_string());
      }
    }
    writer.write_end_element();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security::message::xml_writer::canonical_bytes;

  #[test]
  fn matching_ignores_derivation() {
    let id = UniqueId::new();
    let plain = KeyIdentifierClause::security_context(id.clone(), None);
    let derived =
      KeyIdentifierClause::security_context(id, None).with_derivation(vec![1, 2, 3], Some(32));
    assert!(plain.matches(&derived));
    assert_eq!(derived.derivation_nonce(), Some(&[1u8, 2, 3][..]));
    assert_eq!(plain.derivation_nonce(), None);
  }

  #[test]
  fn context_id_is_found_through_wrapping() {
    let id = UniqueId::new();
    let clause = KeyIdentifierClause::encrypted_key(
      vec![9; 16],
      "kw",
      WrappingKeyReference::SecurityContext {
        context_id: id.clone(),
        generation: None,
      },
    );
    assert_eq!(clause.security_context_id(), Some(&id));
    assert_eq!(KeyIdentifierClause::local_id("_1").security_context_id(), None);
  }

  #[test]
  fn security_context_reference_is_written() {
    let standards = SecurityStandardsManager::default();
    let id = UniqueId::from("urn:uuid:ctx");
    let bytes = canonical_bytes(|w| {
      KeyIdentifierClause::security_context(id, Some(UniqueId::from("urn:uuid:gen")))
        .write_to(w, &standards)
    });
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("URI=\"urn:uuid:ctx\""));
    assert!(text.contains("c:Instance=\"urn:uuid:gen\""));
  }
}
