mod common;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use common::{init_logging, TIMEOUT};
use rustwssec::{
  security::{
    cryptographic::SymmetricKey,
    message::{
      security_header::{SecurityHeaderElement, SecurityTokenReferenceElement},
      Message, MessageBody,
    },
    protocol::{
      protection_requirements::ProtectionLevel, ChannelProtectionRequirements,
      DuplexSecurityProtocol, MessageProtectionOrder, MessagePartSpecification,
      SecurityHeaderLayout, SecurityProtocol, SecurityProtocolBinding, SecurityProtocolFactory,
      SecurityProtocolFactoryBuilder, SecurityProtocolRole,
    },
    session_filter::SecuritySessionFilter,
    standards::{FaultSubcode, SecurityStandardsManager},
    tokens::{
      provider::{FixedTokenProvider, OutOfBandTokenResolver},
      KeyIdentifierClause, SecurityContextSecurityToken, SecurityToken, SecurityTokenParameters,
    },
    trust::{RequestSecurityToken, RequestType},
    types::UniqueId,
  },
  SecurityErrorKind,
};

fn session_token() -> SecurityToken {
  let now = Utc::now();
  SecurityToken::SecurityContext(SecurityContextSecurityToken::new(
    UniqueId::new(),
    "_session",
    SymmetricKey::generate_random(32),
    now,
    now + ChronoDuration::hours(1),
    vec![],
  ))
}

fn builder(level: ProtectionLevel) -> SecurityProtocolFactoryBuilder {
  SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Symmetric {
    protection_token_parameters: SecurityTokenParameters::secure_conversation(),
  })
  .protection_requirements(ChannelProtectionRequirements::for_all_actions(level).unwrap())
}

fn client(token: &SecurityToken, builder: SecurityProtocolFactoryBuilder) -> Arc<dyn SecurityProtocol> {
  builder
    .token_provider(Arc::new(FixedTokenProvider::new(token.clone())))
    .build()
    .unwrap()
    .create_protocol(SecurityProtocolRole::Initiator)
    .unwrap()
}

fn service(token: &SecurityToken, builder: SecurityProtocolFactoryBuilder) -> Arc<dyn SecurityProtocol> {
  builder
    .out_of_band_resolver(Arc::new(OutOfBandTokenResolver::new(vec![token.clone()])))
    .build()
    .unwrap()
    .create_protocol(SecurityProtocolRole::Recipient)
    .unwrap()
}

fn request() -> Message {
  Message::new(
    "urn:test:order",
    MessageBody::Raw(Bytes::from_static(b"<order>3</order>")),
  )
}

#[test]
fn encrypt_before_sign_with_timestamp_last() {
  init_logging();
  let token = session_token();
  let configure = || {
    builder(ProtectionLevel::EncryptAndSign)
      .protection_order(MessageProtectionOrder::EncryptBeforeSign)
      .layout(SecurityHeaderLayout::LaxTimestampLast)
  };
  let client = client(&token, configure());
  let service = service(&token, configure());

  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  assert!(message.body.is_encrypted());
  let header = message.security_header.as_ref().unwrap();
  assert_eq!(header.elements.last().unwrap().kind_name(), "Timestamp");

  service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .unwrap();
  assert_eq!(
    message.body.content_bytes(&SecurityStandardsManager::default()),
    b"<order>3</order>".to_vec()
  );
  assert!(message
    .properties
    .security
    .as_ref()
    .unwrap()
    .protection_token
    .is_some());
}

#[test]
fn protection_order_must_match() {
  let token = session_token();
  let client = client(
    &token,
    builder(ProtectionLevel::EncryptAndSign).protection_order(MessageProtectionOrder::EncryptBeforeSign),
  );
  let service = service(&token, builder(ProtectionLevel::EncryptAndSign));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  assert!(service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .is_err());
}

#[test]
fn signature_only_does_not_satisfy_encryption_requirement() {
  let token = session_token();
  let client = client(&token, builder(ProtectionLevel::Sign));
  let service = service(&token, builder(ProtectionLevel::EncryptAndSign));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  assert!(!message.body.is_encrypted());
  let error = service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .unwrap_err();
  assert_eq!(error.kind(), SecurityErrorKind::MessageSecurity);
}

#[test]
fn tampered_body_is_rejected() {
  let token = session_token();
  let client = client(&token, builder(ProtectionLevel::Sign));
  let service = service(&token, builder(ProtectionLevel::Sign));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  message.body = MessageBody::Raw(Bytes::from_static(b"<order>300</order>"));
  assert!(service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .is_err());
}

#[test]
fn stranger_token_is_rejected() {
  let token = session_token();
  let client = client(&token, builder(ProtectionLevel::Sign));
  let service = service(&session_token(), builder(ProtectionLevel::Sign));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  assert!(service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .is_err());
}

#[test]
fn replayed_message_is_detected() {
  init_logging();
  let token = session_token();
  let client = client(&token, builder(ProtectionLevel::Sign));
  let service = service(&token, builder(ProtectionLevel::Sign).detect_replays(true));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  let mut replay = message.clone();
  service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .unwrap();
  assert!(service
    .verify_incoming_message(&mut replay, TIMEOUT, &[])
    .is_err());
}

fn signed_request(token: &SecurityToken) -> Message {
  let client = client(token, builder(ProtectionLevel::Sign));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  message
}

fn assert_duplicate_id(service: &Arc<dyn SecurityProtocol>, message: &mut Message) {
  let error = service
    .verify_incoming_message(message, TIMEOUT, &[])
    .unwrap_err();
  assert_eq!(error.kind(), SecurityErrorKind::MessageSecurity);
  assert_eq!(error.fault_subcode(), Some(FaultSubcode::InvalidSecurity));
  assert!(error.message().contains("Duplicate element id"));
}

#[test]
fn duplicate_element_ids_are_rejected() {
  let token = session_token();
  let service = service(&token, builder(ProtectionLevel::Sign));

  // a reference reusing the timestamp id
  let mut message = signed_request(&token);
  let header = message.security_header.as_mut().unwrap();
  let timestamp_id = header.timestamp().unwrap().id.clone();
  header
    .elements
    .push(SecurityHeaderElement::SecurityTokenReference(
      SecurityTokenReferenceElement {
        id: timestamp_id,
        clause: KeyIdentifierClause::local_id("_session"),
      },
    ));
  assert_duplicate_id(&service, &mut message);

  // timestamp and signature sharing one id
  let mut message = signed_request(&token);
  let header = message.security_header.as_mut().unwrap();
  let timestamp_id = header.timestamp().unwrap().id.clone();
  let signature = header
    .elements
    .iter_mut()
    .find_map(|e| match e {
      SecurityHeaderElement::Signature(signature) => Some(signature),
      _ => None,
    })
    .unwrap();
  signature.id = timestamp_id;
  assert_duplicate_id(&service, &mut message);

  // a header element colliding with the body
  let mut message = signed_request(&token);
  let timestamp_id = message
    .security_header
    .as_ref()
    .unwrap()
    .timestamp()
    .unwrap()
    .id
    .clone();
  message.body_id = Some(timestamp_id);
  assert_duplicate_id(&service, &mut message);
}

#[test]
fn session_filter_routes_secured_messages() {
  let token = session_token();
  let context_id = token.as_security_context().unwrap().context_id().clone();
  let client = client(&token, builder(ProtectionLevel::EncryptAndSign));
  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();

  let standards = SecurityStandardsManager::default();
  let ours = SecuritySessionFilter::new(context_id, standards);
  let other = SecuritySessionFilter::new(UniqueId::new(), standards);
  assert!(ours.matches(&mut message).unwrap());
  assert!(!other.matches(&mut message).unwrap());
}

#[test]
fn duplex_secures_both_directions() {
  init_logging();
  let forward_token = session_token();
  let reverse_token = session_token();
  let factory = |token: &SecurityToken, initiator: bool| -> Arc<SecurityProtocolFactory> {
    let builder = builder(ProtectionLevel::EncryptAndSign);
    let builder = if initiator {
      builder.token_provider(Arc::new(FixedTokenProvider::new(token.clone())))
    } else {
      builder.out_of_band_resolver(Arc::new(OutOfBandTokenResolver::new(vec![token.clone()])))
    };
    builder.build().unwrap()
  };

  // the client initiates forward; the service initiates callbacks
  let client = DuplexSecurityProtocol::create(
    Some(&factory(&forward_token, true)),
    Some(&factory(&reverse_token, false)),
    SecurityProtocolRole::Initiator,
    true,
  )
  .unwrap();
  let service = DuplexSecurityProtocol::create(
    Some(&factory(&forward_token, false)),
    Some(&factory(&reverse_token, true)),
    SecurityProtocolRole::Recipient,
    true,
  )
  .unwrap();

  let mut message = request();
  client
    .secure_outgoing_message(&mut message, TIMEOUT, None)
    .unwrap();
  service
    .verify_incoming_message(&mut message, TIMEOUT, &[])
    .unwrap();

  let mut callback = Message::new(
    "urn:test:notify",
    MessageBody::Raw(Bytes::from_static(b"<shipped/>")),
  );
  service
    .secure_outgoing_message(&mut callback, TIMEOUT, None)
    .unwrap();
  assert!(callback.body.is_encrypted());
  client
    .verify_incoming_message(&mut callback, TIMEOUT, &[])
    .unwrap();
}

#[test]
fn read_only_values_refuse_changes() {
  let mut rst = RequestSecurityToken::new(SecurityStandardsManager::default(), RequestType::Issue);
  rst.set_context("uuid-1").unwrap();
  rst.make_read_only();
  let error = rst.set_context("uuid-2").unwrap_err();
  assert_eq!(error.kind(), SecurityErrorKind::InvalidOperation);

  let mut requirements =
    ChannelProtectionRequirements::for_all_actions(ProtectionLevel::Sign).unwrap();
  requirements.make_read_only();
  assert!(requirements
    .add(&ChannelProtectionRequirements::new())
    .is_err());

  let mut parts = MessagePartSpecification::body();
  parts.make_read_only();
  assert!(parts.set_body_included(false).is_err());
}
