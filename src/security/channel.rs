//! Transport collaborators consumed by the negotiation provider: request
//! channels and the factories that create them.

use std::{
  any::{Any, TypeId},
  collections::HashMap,
  fmt,
  sync::Mutex,
  time::Duration,
};

use futures::future::{self, BoxFuture, FutureExt};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{message::Message, SecurityResult},
  security_error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
  Created,
  Opening,
  Opened,
  Closing,
  Closed,
  Faulted,
}

/// Open / close / abort lifecycle shared by channels, factories and token
/// providers.
pub trait CommunicationObject: Send + Sync {
  fn open(&self, timeout: Duration) -> SecurityResult<()>;
  fn close(&self, timeout: Duration) -> SecurityResult<()>;
  fn abort(&self);
  fn state(&self) -> CommunicationState;
}

/// Lifecycle state holder for [`CommunicationObject`] implementations.
#[derive(Debug)]
pub struct CommunicationStateCell {
  state: Mutex<CommunicationState>,
}

impl CommunicationStateCell {
  pub fn new() -> Self {
    CommunicationStateCell {
      state: Mutex::new(CommunicationState::Created),
    }
  }

  pub fn get(&self) -> CommunicationState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  /// Runs `action` between the Opening and Opened transitions. A failing
  /// action leaves the object Faulted.
  pub fn open_with<F>(&self, action: F) -> SecurityResult<()>
  where
    F: FnOnce() -> SecurityResult<()>,
  {
    self.transition(CommunicationState::Created, CommunicationState::Opening)?;
    match action() {
      Ok(()) => self.set(CommunicationState::Opened),
      Err(e) => {
        self.set(CommunicationState::Faulted)?;
        Err(e)
      }
    }
  }

  pub fn close_with<F>(&self, action: F) -> SecurityResult<()>
  where
    F: FnOnce() -> SecurityResult<()>,
  {
    match self.get() {
      CommunicationState::Closed => return Ok(()),
      CommunicationState::Created | CommunicationState::Opened | CommunicationState::Faulted => {}
      other => {
        return Err(security_error!(
          InvalidOperation,
          "Cannot close a communication object in state {other:?}"
        ))
      }
    }
    self.set(CommunicationState::Closing)?;
    let result = action();
    self.set(CommunicationState::Closed)?;
    result
  }

  pub fn abort(&self) {
    if let Err(e) = self.set(CommunicationState::Closed) {
      warn!("Abort could not update state: {e}");
    }
  }

  pub fn ensure_opened(&self) -> SecurityResult<()> {
    match self.get() {
      CommunicationState::Opened => Ok(()),
      state => Err(security_error!(
        InvalidOperation,
        "The communication object must be opened, current state is {state:?}"
      )),
    }
  }

  fn set(&self, new_state: CommunicationState) -> SecurityResult<()> {
    *self.state.lock()? = new_state;
    Ok(())
  }

  fn transition(&self, from: CommunicationState, to: CommunicationState) -> SecurityResult<()> {
    let mut state = self.state.lock()?;
    if *state != from {
      return Err(security_error!(
        InvalidOperation,
        "Invalid state transition {:?} -> {to:?}",
        *state
      ));
    }
    *state = to;
    Ok(())
  }
}

impl Default for CommunicationStateCell {
  fn default() -> Self {
    Self::new()
  }
}

/// Channel binding token of the underlying secure transport (RFC 5929
/// style), mixed into negotiation by mechanisms that support extended
/// protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding(pub Vec<u8>);

pub trait RequestChannel: CommunicationObject {
  fn request(&self, message: Message, timeout: Duration) -> SecurityResult<Message>;

  fn request_async(&self, message: Message, timeout: Duration) -> BoxFuture<'_, SecurityResult<Message>> {
    future::ready(self.request(message, timeout)).boxed()
  }

  /// Available only once the channel is open.
  fn channel_binding(&self) -> Option<ChannelBinding> {
    None
  }
}

/// Typed capability bag answered by [`ChannelFactory::get_property`].
#[derive(Default)]
pub struct ChannelProperties {
  values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ChannelProperties {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
    self.values.insert(TypeId::of::<T>(), Box::new(value));
  }

  pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
    self
      .values
      .get(&TypeId::of::<T>())
      .and_then(|v| v.downcast_ref::<T>())
  }
}

impl fmt::Debug for ChannelProperties {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ChannelProperties({} entries)", self.values.len())
  }
}

pub trait ChannelFactory: CommunicationObject {
  fn create_channel(&self, address: &str) -> SecurityResult<Box<dyn RequestChannel>>;

  fn properties(&self) -> &ChannelProperties;
}

impl dyn ChannelFactory {
  pub fn get_property<T: Any + Send + Sync>(&self) -> Option<&T> {
    self.properties().get::<T>()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security::SecurityErrorKind;

  #[test]
  fn lifecycle_transitions() {
    let cell = CommunicationStateCell::new();
    assert!(cell.ensure_opened().is_err());
    cell.open_with(|| Ok(())).unwrap();
    assert_eq!(cell.get(), CommunicationState::Opened);
    let again = cell.open_with(|| Ok(())).unwrap_err();
    assert_eq!(again.kind(), SecurityErrorKind::InvalidOperation);
    cell.close_with(|| Ok(())).unwrap();
    assert_eq!(cell.get(), CommunicationState::Closed);
    cell.close_with(|| Ok(())).unwrap();
  }

  #[test]
  fn failed_open_faults() {
    let cell = CommunicationStateCell::new();
    let result = cell.open_with(|| Err(security_error!(Timeout, "too slow")));
    assert!(result.is_err());
    assert_eq!(cell.get(), CommunicationState::Faulted);
  }

  #[test]
  fn typed_properties() {
    #[derive(Debug, PartialEq)]
    struct MaxMessageSize(usize);
    let mut props = ChannelProperties::new();
    props.insert(MaxMessageSize(65536));
    assert_eq!(props.get::<MaxMessageSize>(), Some(&MaxMessageSize(65536)));
    assert_eq!(props.get::<String>(), None);
  }
}
