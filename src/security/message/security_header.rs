use chrono::{DateTime, SecondsFormat, Utc};
use speedy::{Context, Endianness, Readable, Writable};

use crate::security::{
  message::xml_writer::{canonical_bytes, XmlWriter, XmlWriterExt},
  standards::{
    SecurityStandardsManager, SOAP12_ENVELOPE_NAMESPACE, USERNAME_TOKEN_TYPE, WSSE11_NAMESPACE,
    WSU_NAMESPACE, X509_TOKEN_TYPE, XMLDSIG_NAMESPACE, XMLENC_NAMESPACE,
  },
  tokens::key_identifier::KeyIdentifierClause,
  types::UniqueId,
  SecurityResult,
};

/// `wsu:Timestamp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampElement {
  pub id: String,
  pub created: DateTime<Utc>,
  pub expires: Option<DateTime<Utc>>,
}

// Timestamps travel as milliseconds since the Unix epoch.
impl<'a, C: Context> Readable<'a, C> for TimestampElement {
  fn read_from<R: speedy::Reader<'a, C>>(reader: &mut R) -> Result<Self, <C as Context>::Error> {
    let id: String = reader.read_value()?;
    let created = reader.read_i64()?;
    let expires: Option<i64> = reader.read_value()?;
    let to_time = |millis: i64| {
      DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| speedy::Error::custom("Timestamp out of range").into())
    };
    Ok(TimestampElement {
      id,
      created: to_time(created)?,
      expires: expires.map(to_time).transpose()?,
    })
  }

  #[inline]
  fn minimum_bytes_needed() -> usize {
    4 + 8 + 1
  }
}

impl<C: Context> Writable<C> for TimestampElement {
  fn write_to<T: ?Sized + speedy::Writer<C>>(
    &self,
    writer: &mut T,
  ) -> Result<(), <C as Context>::Error> {
    writer.write_value(&self.id)?;
    writer.write_i64(self.created.timestamp_millis())?;
    writer.write_value(&self.expires.map(|e| e.timestamp_millis()))
  }
}

fn xml_time(t: &DateTime<Utc>) -> String {
  t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Token data as it appears in the security header.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub enum WireToken {
  SecurityContext {
    context_id: UniqueId,
    generation: Option<UniqueId>,
  },
  X509 {
    raw_data: Vec<u8>,
  },
  UserName {
    user_name: String,
    password: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct TokenElement {
  pub id: String,
  pub token: WireToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct EncryptedKeyElement {
  pub id: String,
  pub encryption_method: String,
  pub key_info: KeyIdentifierClause,
  pub cipher_value: Vec<u8>,
  /// Data references encrypted under this key, when the key carries its own
  /// reference list instead of a separate `xenc:ReferenceList`.
  pub reference_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct DerivedKeyTokenElement {
  pub id: String,
  pub base: KeyIdentifierClause,
  pub label: Option<String>,
  pub nonce: Vec<u8>,
  pub length: u32,
  pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SignatureReference {
  /// Local id of the signed element, without the leading '#'
  pub uri: String,
  pub digest_method: String,
  pub digest_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SignedInfo {
  pub canonicalization_method: String,
  pub signature_method: String,
  pub references: Vec<SignatureReference>,
}

impl SignedInfo {
  pub fn write_to(&self, writer: &mut dyn XmlWriter) {
    writer.write_start_element("", "SignedInfo", XMLDSIG_NAMESPACE);
    writer.write_start_element("", "CanonicalizationMethod", XMLDSIG_NAMESPACE);
    writer.write_attribute("", "Algorithm", "", &self.canonicalization_method);
    writer.write_end_element();
    writer.write_start_element("", "SignatureMethod", XMLDSIG_NAMESPACE);
    writer.write_attribute("", "Algorithm", "", &self.signature_method);
    writer.write_end_element();
    for reference in &self.references {
      writer.write_start_element("", "Reference", XMLDSIG_NAMESPACE);
      writer.write_attribute("", "URI", "", &format!("#{}", reference.uri));
      writer.write_start_element("", "DigestMethod", XMLDSIG_NAMESPACE);
      writer.write_attribute("", "Algorithm", "", &reference.digest_method);
      writer.write_end_element();
      writer.write_element_base64("", "DigestValue", XMLDSIG_NAMESPACE, &reference.digest_value);
      writer.write_end_element();
    }
    writer.write_end_element();
  }

  /// The bytes the signature value is computed over.
  pub fn canonical_bytes(&self) -> Vec<u8> {
    canonical_bytes(|w| self.write_to(w))
  }

  pub fn reference(&self, id: &str) -> Option<&SignatureReference> {
    self.references.iter().find(|r| r.uri == id)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SignatureElement {
  pub id: String,
  pub signed_info: SignedInfo,
  pub signature_value: Vec<u8>,
  pub key_info: KeyIdentifierClause,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SignatureConfirmationElement {
  pub id: String,
  /// None confirms that the request carried no signature.
  pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct ReferenceListElement {
  pub id: Option<String>,
  pub data_references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct EncryptedData {
  pub id: String,
  pub encryption_method: String,
  pub key_info: Option<KeyIdentifierClause>,
  pub cipher_value: Vec<u8>,
}

impl EncryptedData {
  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    writer.write_start_element("e", "EncryptedData", XMLENC_NAMESPACE);
    writer.write_attribute("", "Id", "", &self.id);
    writer.write_start_element("e", "EncryptionMethod", XMLENC_NAMESPACE);
    writer.write_attribute("", "Algorithm", "", &self.encryption_method);
    writer.write_end_element();
    if let Some(key_info) = &self.key_info {
      writer.write_start_element("", "KeyInfo", XMLDSIG_NAMESPACE);
      key_info.write_to(writer, standards);
      writer.write_end_element();
    }
    writer.write_start_element("e", "CipherData", XMLENC_NAMESPACE);
    writer.write_element_base64("e", "CipherValue", XMLENC_NAMESPACE, &self.cipher_value);
    writer.write_end_element();
    writer.write_end_element();
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SecurityTokenReferenceElement {
  pub id: String,
  pub clause: KeyIdentifierClause,
}

/// One child of `<wsse:Security>`.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub enum SecurityHeaderElement {
  Timestamp(TimestampElement),
  Token(TokenElement),
  EncryptedKey(EncryptedKeyElement),
  DerivedKeyToken(DerivedKeyTokenElement),
  Signature(SignatureElement),
  SignatureConfirmation(SignatureConfirmationElement),
  ReferenceList(ReferenceListElement),
  EncryptedData(EncryptedData),
  SecurityTokenReference(SecurityTokenReferenceElement),
}

impl SecurityHeaderElement {
  pub fn id(&self) -> Option<&str> {
    match self {
      SecurityHeaderElement::Timestamp(e) => Some(&e.id),
      SecurityHeaderElement::Token(e) => Some(&e.id),
      SecurityHeaderElement::EncryptedKey(e) => Some(&e.id),
      SecurityHeaderElement::DerivedKeyToken(e) => Some(&e.id),
      SecurityHeaderElement::Signature(e) => Some(&e.id),
      SecurityHeaderElement::SignatureConfirmation(e) => Some(&e.id),
      SecurityHeaderElement::ReferenceList(e) => e.id.as_deref(),
      SecurityHeaderElement::EncryptedData(e) => Some(&e.id),
      SecurityHeaderElement::SecurityTokenReference(e) => Some(&e.id),
    }
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      SecurityHeaderElement::Timestamp(_) => "Timestamp",
      SecurityHeaderElement::Token(_) => "Token",
      SecurityHeaderElement::EncryptedKey(_) => "EncryptedKey",
      SecurityHeaderElement::DerivedKeyToken(_) => "DerivedKeyToken",
      SecurityHeaderElement::Signature(_) => "Signature",
      SecurityHeaderElement::SignatureConfirmation(_) => "SignatureConfirmation",
      SecurityHeaderElement::ReferenceList(_) => "ReferenceList",
      SecurityHeaderElement::EncryptedData(_) => "EncryptedData",
      SecurityHeaderElement::SecurityTokenReference(_) => "SecurityTokenReference",
    }
  }

  /// Binary form of the element, used as plaintext when a header element is
  /// encrypted.
  pub fn to_binary(&self) -> SecurityResult<Vec<u8>> {
    Ok(self.write_to_vec_with_ctx(Endianness::LittleEndian)?)
  }

  pub fn from_binary(bytes: &[u8]) -> SecurityResult<Self> {
    Ok(Self::read_from_buffer_with_ctx(
      Endianness::LittleEndian,
      bytes,
    )?)
  }

  pub fn canonical_bytes(&self, standards: &SecurityStandardsManager) -> Vec<u8> {
    canonical_bytes(|w| self.write_to(w, standards))
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let wsse = standards.security_version().namespace();
    let wsc = standards.secure_conversation_version().namespace();
    match self {
      SecurityHeaderElement::Timestamp(ts) => {
        writer.write_start_element("u", "Timestamp", WSU_NAMESPACE);
        writer.write_wsu_id(&ts.id);
        writer.write_element_string("u", "Created", WSU_NAMESPACE, &xml_time(&ts.created));
        if let Some(expires) = &ts.expires {
          writer.write_element_string("u", "Expires", WSU_NAMESPACE, &xml_time(expires));
        }
        writer.write_end_element();
      }
      SecurityHeaderElement::Token(TokenElement { id, token }) => match token {
        WireToken::SecurityContext {
          context_id,
          generation,
        } => {
          writer.write_start_element("c", "SecurityContextToken", wsc);
          writer.write_wsu_id(id);
          writer.write_element_string("c", "Identifier", wsc, context_id.as_str());
          if let Some(generation) = generation {
            writer.write_element_string("c", "Instance", wsc, generation.as_str());
          }
          writer.write_end_element();
        }
        WireToken::X509 { raw_data } => {
          writer.write_start_element("o", "BinarySecurityToken", wsse);
          writer.write_wsu_id(id);
          writer.write_attribute("", "ValueType", "", X509_TOKEN_TYPE);
          writer.write_base64(raw_data);
          writer.write_end_element();
        }
        WireToken::UserName {
          user_name,
          password,
        } => {
          writer.write_start_element("o", "UsernameToken", wsse);
          writer.write_wsu_id(id);
          writer.write_element_string("o", "Username", wsse, user_name);
          writer.write_start_element("o", "Password", wsse);
          writer.write_attribute("", "Type", "", USERNAME_TOKEN_TYPE);
          writer.write_string(password);
          writer.write_end_element();
          writer.write_end_element();
        }
      },
      SecurityHeaderElement::EncryptedKey(ek) => {
        writer.write_start_element("e", "EncryptedKey", XMLENC_NAMESPACE);
        writer.write_attribute("", "Id", "", &ek.id);
        writer.write_start_element("e", "EncryptionMethod", XMLENC_NAMESPACE);
        writer.write_attribute("", "Algorithm", "", &ek.encryption_method);
        writer.write_end_element();
        writer.write_start_element("", "KeyInfo", XMLDSIG_NAMESPACE);
        ek.key_info.write_to(writer, standards);
        writer.write_end_element();
        writer.write_start_element("e", "CipherData", XMLENC_NAMESPACE);
        writer.write_element_base64("e", "CipherValue", XMLENC_NAMESPACE, &ek.cipher_value);
        writer.write_end_element();
        if !ek.reference_list.is_empty() {
          write_reference_list(writer, None, &ek.reference_list);
        }
        writer.write_end_element();
      }
      SecurityHeaderElement::DerivedKeyToken(dk) => {
        writer.write_start_element("c", "DerivedKeyToken", wsc);
        writer.write_wsu_id(&dk.id);
        dk.base.write_to(writer, standards);
        writer.write_element_string("c", "Offset", wsc, &dk.offset.to_string());
        writer.write_element_string("c", "Length", wsc, &dk.length.to_string());
        if let Some(label) = &dk.label {
          writer.write_element_string("c", "Label", wsc, label);
        }
        writer.write_element_base64("c", "Nonce", wsc, &dk.nonce);
        writer.write_end_element();
      }
      SecurityHeaderElement::Signature(sig) => {
        writer.write_start_element("", "Signature", XMLDSIG_NAMESPACE);
        writer.write_attribute("", "Id", "", &sig.id);
        sig.signed_info.write_to(writer);
        writer.write_element_base64("", "SignatureValue", XMLDSIG_NAMESPACE, &sig.signature_value);
        writer.write_start_element("", "KeyInfo", XMLDSIG_NAMESPACE);
        sig.key_info.write_to(writer, standards);
        writer.write_end_element();
        writer.write_end_element();
      }
      SecurityHeaderElement::SignatureConfirmation(sc) => {
        writer.write_start_element("k", "SignatureConfirmation", WSSE11_NAMESPACE);
        writer.write_wsu_id(&sc.id);
        if let Some(value) = &sc.value {
          writer.write_attribute(
            "",
            "Value",
            "",
            &crate::security::message::xml_writer::encode_base64(value),
          );
        }
        writer.write_end_element();
      }
      SecurityHeaderElement::ReferenceList(rl) => {
        write_reference_list(writer, rl.id.as_deref(), &rl.data_references);
      }
      SecurityHeaderElement::EncryptedData(ed) => ed.write_to(writer, standards),
      SecurityHeaderElement::SecurityTokenReference(str_element) => {
        // The clause writes its own SecurityTokenReference element; the id
        // is carried on a wrapper so that it can be signed by reference.
        writer.write_start_element("o", "Embedded", wsse);
        writer.write_wsu_id(&str_element.id);
        str_element.clause.write_to(writer, standards);
        writer.write_end_element();
      }
    }
  }
}

fn write_reference_list(writer: &mut dyn XmlWriter, id: Option<&str>, references: &[String]) {
  writer.write_start_element("e", "ReferenceList", XMLENC_NAMESPACE);
  if let Some(id) = id {
    writer.write_wsu_id(id);
  }
  for reference in references {
    writer.write_start_element("e", "DataReference", XMLENC_NAMESPACE);
    writer.write_attribute("", "URI", "", &format!("#{reference}"));
    writer.write_end_element();
  }
  writer.write_end_element();
}

/// `<wsse:Security>` header: an ordered list of elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityHeader {
  pub must_understand: bool,
  pub elements: Vec<SecurityHeaderElement>,
}

impl SecurityHeader {
  pub fn new() -> Self {
    SecurityHeader {
      must_understand: true,
      elements: Vec::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  pub fn find_by_id(&self, id: &str) -> Option<&SecurityHeaderElement> {
    self.elements.iter().find(|e| e.id() == Some(id))
  }

  pub fn timestamp(&self) -> Option<&TimestampElement> {
    self.elements.iter().find_map(|e| match e {
      SecurityHeaderElement::Timestamp(ts) => Some(ts),
      _ => None,
    })
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    writer.write_start_element("o", "Security", standards.security_version().namespace());
    if self.must_understand {
      writer.write_attribute("s", "mustUnderstand", SOAP12_ENVELOPE_NAMESPACE, "1");
    }
    for element in &self.elements {
      element.write_to(writer, standards);
    }
    writer.write_end_element();
  }

  pub fn canonical_bytes(&self, standards: &SecurityStandardsManager) -> Vec<u8> {
    canonical_bytes(|w| self.write_to(w, standards))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn encrypted_element_payload_survives_binary_encoding() {
    let created = Utc.timestamp_millis_opt(1_600_000_000_123).unwrap();
    let element = SecurityHeaderElement::Timestamp(TimestampElement {
      id: "_0".to_string(),
      created,
      expires: Some(created + chrono::Duration::minutes(5)),
    });
    let bytes = element.to_binary().unwrap();
    assert_eq!(SecurityHeaderElement::from_binary(&bytes).unwrap(), element);
    assert!(SecurityHeaderElement::from_binary(&bytes[..3]).is_err());
  }

  #[test]
  fn timestamp_is_written_with_millisecond_precision() {
    let created = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
    let element = SecurityHeaderElement::Timestamp(TimestampElement {
      id: "_0".to_string(),
      created,
      expires: None,
    });
    let text =
      String::from_utf8(element.canonical_bytes(&SecurityStandardsManager::default())).unwrap();
    assert!(text.contains("<u:Created>2020-01-02T03:04:05.000Z</u:Created>"));
    assert!(!text.contains("Expires"));
  }

  #[test]
  fn header_lookup_by_id() {
    let mut header = SecurityHeader::new();
    header
      .elements
      .push(SecurityHeaderElement::ReferenceList(ReferenceListElement {
        id: None,
        data_references: vec!["_1".to_string()],
      }));
    header
      .elements
      .push(SecurityHeaderElement::SignatureConfirmation(
        SignatureConfirmationElement {
          id: "_2".to_string(),
          value: None,
        },
      ));
    assert_eq!(header.find_by_id("_2").map(|e| e.kind_name()), Some("SignatureConfirmation"));
    assert!(header.find_by_id("_1").is_none());
    assert!(header.timestamp().is_none());
  }
}
