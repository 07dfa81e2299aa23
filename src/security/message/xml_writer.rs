use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::security::standards::WSU_NAMESPACE;

/// Sink for XML infoset events. Canonical bytes for digests and signatures
/// are produced by writing elements through this interface.
pub trait XmlWriter {
  fn write_start_element(&mut self, prefix: &str, local_name: &str, namespace: &str);
  fn write_attribute(&mut self, prefix: &str, local_name: &str, namespace: &str, value: &str);
  fn write_string(&mut self, text: &str);
  fn write_base64(&mut self, bytes: &[u8]);
  /// Appends bytes that are already in canonical form.
  fn write_raw(&mut self, canonical: &[u8]);
  fn write_end_element(&mut self);
}

/// Convenience writers on top of [`XmlWriter`].
pub trait XmlWriterExt: XmlWriter {
  fn write_element_string(&mut self, prefix: &str, local_name: &str, namespace: &str, text: &str) {
    self.write_start_element(prefix, local_name, namespace);
    self.write_string(text);
    self.write_end_element();
  }

  fn write_element_base64(&mut self, prefix: &str, local_name: &str, namespace: &str, bytes: &[u8]) {
    self.write_start_element(prefix, local_name, namespace);
    self.write_base64(bytes);
    self.write_end_element();
  }

  fn write_wsu_id(&mut self, id: &str) {
    self.write_attribute("u", "Id", WSU_NAMESPACE, id);
  }
}

impl<W: XmlWriter + ?Sized> XmlWriterExt for W {}

struct OpenElement {
  qualified_name: String,
  // prefix -> namespace declared on this element
  declared: BTreeMap<String, String>,
}

struct PendingStartTag {
  qualified_name: String,
  namespaces: BTreeMap<String, String>,
  // (namespace, local name) -> (qualified name, value); sorted the way
  // exclusive canonicalization sorts attributes
  attributes: BTreeMap<(String, String), (String, String)>,
}

/// Deterministic XML writer in the style of exclusive canonicalization:
/// namespace declarations are emitted where first used and sorted by prefix,
/// attributes are sorted by (namespace, local name), empty elements get an
/// explicit end tag, and text is escaped the c14n way.
pub struct CanonicalXmlWriter {
  buffer: Vec<u8>,
  stack: Vec<OpenElement>,
  pending: Option<PendingStartTag>,
}

impl CanonicalXmlWriter {
  pub fn new() -> Self {
    CanonicalXmlWriter {
      buffer: Vec::new(),
      stack: Vec::new(),
      pending: None,
    }
  }

  pub fn into_bytes(mut self) -> Vec<u8> {
    self.flush_start_tag();
    while !self.stack.is_empty() {
      self.write_end_element();
    }
    self.buffer
  }

  fn namespace_in_scope(&self, prefix: &str, namespace: &str) -> bool {
    let from_pending = self
      .pending
      .as_ref()
      .and_then(|p| p.namespaces.get(prefix));
    if let Some(ns) = from_pending {
      return ns == namespace;
    }
    self
      .stack
      .iter()
      .rev()
      .find_map(|e| e.declared.get(prefix))
      .map_or(false, |ns| ns == namespace)
  }

  fn flush_start_tag(&mut self) {
    if let Some(tag) = self.pending.take() {
      self.buffer.push(b'<');
      self.buffer.extend_from_slice(tag.qualified_name.as_bytes());
      for (prefix, namespace) in &tag.namespaces {
        if prefix.is_empty() {
          self.buffer.extend_from_slice(b" xmlns=\"");
        } else {
          self.buffer.extend_from_slice(b" xmlns:");
          self.buffer.extend_from_slice(prefix.as_bytes());
          self.buffer.extend_from_slice(b"=\"");
        }
        escape_attribute(namespace, &mut self.buffer);
        self.buffer.push(b'"');
      }
      for (qualified_name, value) in tag.attributes.values() {
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(qualified_name.as_bytes());
        self.buffer.extend_from_slice(b"=\"");
        escape_attribute(value, &mut self.buffer);
        self.buffer.push(b'"');
      }
      self.buffer.push(b'>');
      self.stack.push(OpenElement {
        qualified_name: tag.qualified_name,
        declared: tag.namespaces,
      });
    }
  }
}

impl Default for CanonicalXmlWriter {
  fn default() -> Self {
    Self::new()
  }
}

fn qualify(prefix: &str, local_name: &str) -> String {
  if prefix.is_empty() {
    local_name.to_string()
  } else {
    format!("{prefix}:{local_name}")
  }
}

impl XmlWriter for CanonicalXmlWriter {
  fn write_start_element(&mut self, prefix: &str, local_name: &str, namespace: &str) {
    self.flush_start_tag();
    let mut namespaces = BTreeMap::new();
    if !self.namespace_in_scope(prefix, namespace) {
      namespaces.insert(prefix.to_string(), namespace.to_string());
    }
    self.pending = Some(PendingStartTag {
      qualified_name: qualify(prefix, local_name),
      namespaces,
      attributes: BTreeMap::new(),
    });
  }

  fn write_attribute(&mut self, prefix: &str, local_name: &str, namespace: &str, value: &str) {
    let needs_declaration = !namespace.is_empty() && !self.namespace_in_scope(prefix, namespace);
    if let Some(tag) = self.pending.as_mut() {
      if needs_declaration {
        tag
          .namespaces
          .insert(prefix.to_string(), namespace.to_string());
      }
      tag.attributes.insert(
        (namespace.to_string(), local_name.to_string()),
        (qualify(prefix, local_name), value.to_string()),
      );
    } else {
      log::warn!("Attribute {local_name} written outside of a start tag, ignored");
    }
  }

  fn write_string(&mut self, text: &str) {
    self.flush_start_tag();
    escape_text(text, &mut self.buffer);
  }

  fn write_base64(&mut self, bytes: &[u8]) {
    self.flush_start_tag();
    self
      .buffer
      .extend_from_slice(encode_base64(bytes).as_bytes());
  }

  fn write_raw(&mut self, canonical: &[u8]) {
    self.flush_start_tag();
    self.buffer.extend_from_slice(canonical);
  }

  fn write_end_element(&mut self) {
    self.flush_start_tag();
    if let Some(element) = self.stack.pop() {
      self.buffer.extend_from_slice(b"</");
      self
        .buffer
        .extend_from_slice(element.qualified_name.as_bytes());
      self.buffer.push(b'>');
    }
  }
}

fn escape_text(text: &str, out: &mut Vec<u8>) {
  for c in text.chars() {
    match c {
      '&' => out.extend_from_slice(b"&amp;"),
      '<' => out.extend_from_slice(b"&lt;"),
      '>' => out.extend_from_slice(b"&gt;"),
      '\r' => out.extend_from_slice(b"&#xD;"),
      c => {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
      }
    }
  }
}

fn escape_attribute(text: &str, out: &mut Vec<u8>) {
  for c in text.chars() {
    match c {
      '&' => out.extend_from_slice(b"&amp;"),
      '<' => out.extend_from_slice(b"&lt;"),
      '"' => out.extend_from_slice(b"&quot;"),
      '\t' => out.extend_from_slice(b"&#x9;"),
      '\n' => out.extend_from_slice(b"&#xA;"),
      '\r' => out.extend_from_slice(b"&#xD;"),
      c => {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
      }
    }
  }
}

// xs:base64Binary content of binary elements
pub fn encode_base64(bytes: &[u8]) -> String {
  STANDARD.encode(bytes)
}

/// Canonical bytes of whatever `write` produces.
pub fn canonical_bytes<F>(write: F) -> Vec<u8>
where
  F: FnOnce(&mut dyn XmlWriter),
{
  let mut writer = CanonicalXmlWriter::new();
  write(&mut writer);
  writer.into_bytes()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn namespaces_declared_once_and_attributes_sorted() {
    let bytes = canonical_bytes(|w| {
      w.write_start_element("s", "Envelope", "urn:soap");
      w.write_start_element("s", "Body", "urn:soap");
      w.write_attribute("", "b", "", "2");
      w.write_attribute("", "a", "", "1");
      w.write_string("x < y & z");
      w.write_end_element();
      w.write_end_element();
    });
    assert_eq!(
      String::from_utf8(bytes).unwrap(),
      "<s:Envelope xmlns:s=\"urn:soap\"><s:Body a=\"1\" b=\"2\">x &lt; y &amp; z</s:Body></s:Envelope>"
    );
  }

  #[test]
  fn empty_elements_get_end_tags() {
    let bytes = canonical_bytes(|w| {
      w.write_start_element("", "Empty", "urn:x");
      w.write_end_element();
    });
    assert_eq!(bytes, b"<Empty xmlns=\"urn:x\"></Empty>");
  }

  #[test]
  fn prefixed_attribute_declares_namespace() {
    let bytes = canonical_bytes(|w| {
      w.write_start_element("o", "Security", "urn:wsse");
      w.write_wsu_id("_1");
      w.write_end_element();
    });
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains(&format!("xmlns:u=\"{WSU_NAMESPACE}\"")));
    assert!(text.contains("u:Id=\"_1\""));
  }

  #[test]
  fn base64() {
    assert_eq!(encode_base64(b""), "");
    assert_eq!(encode_base64(b"f"), "Zg==");
    assert_eq!(encode_base64(b"fo"), "Zm8=");
    assert_eq!(encode_base64(b"foo"), "Zm9v");
    assert_eq!(encode_base64(b"foobar"), "Zm9vYmFy");
  }
}
