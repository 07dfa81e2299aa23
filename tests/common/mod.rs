#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use rustwssec::{
  security::{
    channel::{
      ChannelBinding, ChannelFactory, ChannelProperties, CommunicationObject, CommunicationState,
      CommunicationStateCell, RequestChannel,
    },
    message::Message,
    negotiation::{SspiNegotiation, SspiNegotiationFactory},
    standards::FaultSubcode,
  },
  security_error, SecurityResult,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

const MOCK_KEY_WRAP: &str = "urn:test:mock-sspi-wrap";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Step {
  Start,
  Challenged,
  Done,
}

/// Deterministic two-leg handshake. The client announces a user name, the
/// server challenges it, and the client answers with the shared password.
/// Both ends then wrap keys by XOR with the password-derived pad.
pub struct MockSspi {
  server: bool,
  user: String,
  password: String,
  accepted_password: String,
  step: Step,
  peer: Option<String>,
  key_wrap: String,
}

impl MockSspi {
  fn pad(&self) -> Vec<u8> {
    self.accepted_password.bytes().cycle().take(64).collect()
  }

  fn xor(&self, data: &[u8]) -> Vec<u8> {
    data.iter().zip(self.pad().iter().cycle()).map(|(d, p)| d ^ p).collect()
  }
}

impl SspiNegotiation for MockSspi {
  fn get_outgoing_blob(
    &mut self,
    incoming: Option<&[u8]>,
    _channel_binding: Option<&ChannelBinding>,
  ) -> SecurityResult<Option<Vec<u8>>> {
    match (self.server, self.step, incoming) {
      (false, Step::Start, None) => {
        self.step = Step::Challenged;
        Ok(Some(format!("hello:{}", self.user).into_bytes()))
      }
      (false, Step::Challenged, Some(b"challenge")) => {
        self.step = Step::Done;
        self.peer = Some("service".to_string());
        Ok(Some(format!("response:{}", self.password).into_bytes()))
      }
      (false, Step::Done, _) => Ok(None),
      (true, Step::Start, Some(blob)) => {
        let hello = String::from_utf8_lossy(blob);
        let user = hello
          .strip_prefix("hello:")
          .ok_or_else(|| security_error!(Negotiation, "Bad first blob"))?;
        self.peer = Some(user.to_string());
        self.step = Step::Challenged;
        Ok(Some(b"challenge".to_vec()))
      }
      (true, Step::Challenged, Some(blob)) => {
        let expected = format!("response:{}", self.accepted_password);
        if blob != expected.as_bytes() {
          return Err(
            security_error!(Negotiation, "Wrong password")
              .with_fault_subcode(FaultSubcode::FailedAuthentication),
          );
        }
        self.step = Step::Done;
        Ok(None)
      }
      _ => Err(security_error!(Negotiation, "Unexpected handshake blob")),
    }
  }

  fn is_completed(&self) -> bool {
    self.step == Step::Done
  }

  fn key_encryption_algorithm(&self) -> &str {
    &self.key_wrap
  }

  fn encrypt_key(&self, key: &[u8]) -> SecurityResult<Vec<u8>> {
    Ok(self.xor(key))
  }

  fn decrypt_key(&self, wrapped_key: &[u8]) -> SecurityResult<Vec<u8>> {
    Ok(self.xor(wrapped_key))
  }

  fn remote_identity(&self) -> Option<String> {
    if self.is_completed() {
      self.peer.clone()
    } else {
      None
    }
  }
}

pub struct MockSspiFactory {
  pub user: String,
  pub password: String,
  /// Password the server side accepts
  pub accepted_password: String,
  /// Key wrap algorithm reported by client negotiations
  pub client_key_wrap: Option<String>,
}

impl MockSspiFactory {
  pub fn new(user: &str, password: &str, accepted_password: &str) -> Self {
    MockSspiFactory {
      user: user.to_string(),
      password: password.to_string(),
      accepted_password: accepted_password.to_string(),
      client_key_wrap: None,
    }
  }

  pub fn with_client_key_wrap(mut self, algorithm: &str) -> Self {
    self.client_key_wrap = Some(algorithm.to_string());
    self
  }

  fn negotiation(&self, server: bool) -> Box<dyn SspiNegotiation> {
    Box::new(MockSspi {
      server,
      user: self.user.clone(),
      password: self.password.clone(),
      // the client pads with its own password; a mismatch fails the
      // handshake before any key is unwrapped
      accepted_password: if server {
        self.accepted_password.clone()
      } else {
        self.password.clone()
      },
      step: Step::Start,
      peer: None,
      key_wrap: match (&self.client_key_wrap, server) {
        (Some(algorithm), false) => algorithm.clone(),
        _ => MOCK_KEY_WRAP.to_string(),
      },
    })
  }
}

impl SspiNegotiationFactory for MockSspiFactory {
  fn create_server_negotiation(&self) -> SecurityResult<Box<dyn SspiNegotiation>> {
    Ok(self.negotiation(true))
  }

  fn create_client_negotiation(&self, _target: &str) -> SecurityResult<Box<dyn SspiNegotiation>> {
    Ok(self.negotiation(false))
  }
}

pub type Handler = Arc<dyn Fn(Message) -> SecurityResult<Message> + Send + Sync>;

/// Wraps a handler so every reply passes through `tamper` before the
/// client sees it.
pub fn tampering<F>(inner: Handler, tamper: F) -> Handler
where
  F: Fn(&mut Message) + Send + Sync + 'static,
{
  Arc::new(move |request: Message| {
    let mut reply = inner(request)?;
    tamper(&mut reply);
    Ok(reply)
  })
}

/// Request channel delivering each request straight to an in-process
/// handler.
pub struct LoopbackChannel {
  handler: Handler,
  lifecycle: CommunicationStateCell,
}

impl CommunicationObject for LoopbackChannel {
  fn open(&self, _timeout: Duration) -> SecurityResult<()> {
    self.lifecycle.open_with(|| Ok(()))
  }

  fn close(&self, _timeout: Duration) -> SecurityResult<()> {
    self.lifecycle.close_with(|| Ok(()))
  }

  fn abort(&self) {
    self.lifecycle.abort();
  }

  fn state(&self) -> CommunicationState {
    self.lifecycle.get()
  }
}

impl RequestChannel for LoopbackChannel {
  fn request(&self, message: Message, _timeout: Duration) -> SecurityResult<Message> {
    self.lifecycle.ensure_opened()?;
    (self.handler)(message)
  }
}

pub struct LoopbackChannelFactory {
  handler: Handler,
  lifecycle: CommunicationStateCell,
  properties: ChannelProperties,
}

impl LoopbackChannelFactory {
  pub fn new(handler: Handler) -> Arc<Self> {
    Arc::new(LoopbackChannelFactory {
      handler,
      lifecycle: CommunicationStateCell::new(),
      properties: ChannelProperties::new(),
    })
  }
}

impl CommunicationObject for LoopbackChannelFactory {
  fn open(&self, _timeout: Duration) -> SecurityResult<()> {
    self.lifecycle.open_with(|| Ok(()))
  }

  fn close(&self, _timeout: Duration) -> SecurityResult<()> {
    self.lifecycle.close_with(|| Ok(()))
  }

  fn abort(&self) {
    self.lifecycle.abort();
  }

  fn state(&self) -> CommunicationState {
    self.lifecycle.get()
  }
}

impl ChannelFactory for LoopbackChannelFactory {
  fn create_channel(&self, _address: &str) -> SecurityResult<Box<dyn RequestChannel>> {
    self.lifecycle.ensure_opened()?;
    Ok(Box::new(LoopbackChannel {
      handler: self.handler.clone(),
      lifecycle: CommunicationStateCell::new(),
    }))
  }

  fn properties(&self) -> &ChannelProperties {
    &self.properties
  }
}
