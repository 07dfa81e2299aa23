use std::{sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    time::{add_saturating, utc_now},
    tokens::{KeyIdentifierClause, SecurityToken, SecurityTokenProvider, SecurityTokenResolver},
    SecurityResult,
  },
  security_error,
};

struct KeyStateInner {
  current: SecurityToken,
  current_since: DateTime<Utc>,
  // The replaced token, and the moment it stops being accepted
  previous: Option<(SecurityToken, DateTime<Utc>)>,
  // A renewed token that has been issued but not yet switched to
  pending: Option<SecurityToken>,
}

/// Session keys of one secure session.
///
/// Outgoing messages always use the current token. Incoming messages may
/// still be protected with the previous token until its rollover deadline,
/// or already with the pending one.
pub struct SecuritySessionKeyState {
  inner: Mutex<KeyStateInner>,
  renewal_interval: Duration,
  rollover_interval: Duration,
}

impl SecuritySessionKeyState {
  pub fn new(token: SecurityToken, renewal_interval: Duration, rollover_interval: Duration) -> Self {
    SecuritySessionKeyState {
      inner: Mutex::new(KeyStateInner {
        current: token,
        current_since: utc_now(),
        previous: None,
        pending: None,
      }),
      renewal_interval,
      rollover_interval,
    }
  }

  pub fn current_token(&self) -> SecurityResult<SecurityToken> {
    Ok(self.inner.lock()?.current.clone())
  }

  pub fn has_pending_token(&self) -> SecurityResult<bool> {
    Ok(self.inner.lock()?.pending.is_some())
  }

  /// True once the current key has been in use for the renewal interval, or
  /// expires before then.
  pub fn is_renewal_due(&self, now: DateTime<Utc>) -> SecurityResult<bool> {
    let inner = self.inner.lock()?;
    let renew_at = add_saturating(inner.current_since, self.renewal_interval);
    Ok(now >= renew_at || now >= inner.current.valid_to())
  }

  pub fn set_pending(&self, token: SecurityToken) -> SecurityResult<()> {
    let mut inner = self.inner.lock()?;
    if inner.pending.is_some() {
      return Err(security_error!(
        InvalidOperation,
        "A renewed session key is already pending"
      ));
    }
    debug!("Session key {} pending", token.id());
    inner.pending = Some(token);
    Ok(())
  }

  /// Switches to the pending token. The replaced token stays acceptable for
  /// incoming messages until `now` plus the rollover interval.
  pub fn activate_pending(&self, now: DateTime<Utc>) -> SecurityResult<()> {
    let mut inner = self.inner.lock()?;
    let pending = inner.pending.take().ok_or_else(|| {
      security_error!(InvalidOperation, "There is no pending session key to activate")
    })?;
    let replaced = std::mem::replace(&mut inner.current, pending);
    inner.current_since = now;
    inner.previous = Some((replaced, add_saturating(now, self.rollover_interval)));
    debug!("Session key {} activated", inner.current.id());
    Ok(())
  }

  /// Installs a renewed token immediately, as done when the peer initiated
  /// the renewal.
  pub fn rollover(&self, token: SecurityToken, now: DateTime<Utc>) -> SecurityResult<()> {
    {
      let mut inner = self.inner.lock()?;
      inner.pending = None;
    }
    self.set_pending(token)?;
    self.activate_pending(now)
  }

  /// Forgets the previous token once its rollover deadline has passed.
  /// Returns true if a token was dropped.
  pub fn remove_expired(&self, now: DateTime<Utc>) -> SecurityResult<bool> {
    let mut inner = self.inner.lock()?;
    match &inner.previous {
      Some((token, deadline)) if now >= *deadline => {
        debug!("Session key {} rolled over", token.id());
        inner.previous = None;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// All tokens currently acceptable for incoming messages.
  pub fn incoming_tokens(&self, now: DateTime<Utc>) -> SecurityResult<Vec<SecurityToken>> {
    let inner = self.inner.lock()?;
    let mut tokens = vec![inner.current.clone()];
    if let Some((token, deadline)) = &inner.previous {
      if now < *deadline {
        tokens.push(token.clone());
      }
    }
    tokens.extend(inner.pending.iter().cloned());
    Ok(tokens)
  }
}

impl SecurityTokenProvider for SecuritySessionKeyState {
  fn get_token(&self, _timeout: Duration) -> SecurityResult<SecurityToken> {
    self.current_token()
  }
}

impl SecurityTokenResolver for SecuritySessionKeyState {
  fn resolve_token(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken> {
    match self.incoming_tokens(utc_now()) {
      Ok(tokens) => tokens
        .into_iter()
        .find(|t| t.matches_key_identifier_clause(clause)),
      Err(e) => {
        error!("Session key state unavailable: {e}");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration as ChronoDuration;

  use super::*;
  use crate::security::{
    cryptographic::SymmetricKey,
    tokens::{SecurityContextSecurityToken, SecurityTokenReferenceStyle},
    types::UniqueId,
  };

  fn first() -> SecurityContextSecurityToken {
    let now = Utc::now();
    SecurityContextSecurityToken::new(
      UniqueId::new(),
      "_g1",
      SymmetricKey::generate_random(32),
      now,
      now + ChronoDuration::hours(10),
      vec![],
    )
  }

  fn renewed(token: &SecurityContextSecurityToken) -> SecurityToken {
    let now = Utc::now();
    token
      .renew(
        SymmetricKey::generate_random(32),
        now,
        now + ChronoDuration::hours(10),
      )
      .into()
  }

  fn clause(token: &SecurityToken) -> KeyIdentifierClause {
    token
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap()
  }

  #[test]
  fn renewal_becomes_due_after_the_interval() {
    let state = SecuritySessionKeyState::new(
      first().into(),
      Duration::from_secs(60),
      Duration::from_secs(30),
    );
    let now = Utc::now();
    assert!(!state.is_renewal_due(now).unwrap());
    assert!(state
      .is_renewal_due(now + ChronoDuration::seconds(61))
      .unwrap());
  }

  #[test]
  fn previous_key_is_accepted_until_rollover_deadline() {
    let sct = first();
    let first: SecurityToken = sct.clone().into();
    let second = renewed(&sct);
    let state = SecuritySessionKeyState::new(
      first.clone(),
      Duration::from_secs(60),
      Duration::from_secs(30),
    );
    state.set_pending(second.clone()).unwrap();
    assert!(state.set_pending(second.clone()).is_err());
    // pending keys already resolve for incoming messages
    assert!(state.resolve_token(&clause(&second)).is_some());

    let now = Utc::now();
    state.activate_pending(now).unwrap();
    assert_eq!(state.current_token().unwrap().id(), second.id());
    assert!(!state.has_pending_token().unwrap());
    assert!(state.resolve_token(&clause(&first)).is_some());

    let later = now + ChronoDuration::seconds(31);
    assert_eq!(state.incoming_tokens(later).unwrap().len(), 1);
    assert!(!state.remove_expired(now).unwrap());
    assert!(state.remove_expired(later).unwrap());
    assert!(state.resolve_token(&clause(&first)).is_none());
    assert_eq!(
      state.get_token(Duration::from_secs(1)).unwrap().id(),
      second.id()
    );
  }

  #[test]
  fn activation_needs_a_pending_key() {
    let state = SecuritySessionKeyState::new(
      first().into(),
      Duration::from_secs(60),
      Duration::from_secs(30),
    );
    assert!(state.activate_pending(Utc::now()).is_err());
    let sct = first();
    let second = renewed(&sct);
    state.rollover(second.clone(), Utc::now()).unwrap();
    assert_eq!(state.current_token().unwrap().id(), second.id());
  }
}
