use std::time::Duration;

use crate::{
  security::{
    cache::time_bounded_cache::{CacheSettings, PurgingMode, TimeBoundedCache},
    config::DEFAULT_CACHE_LOW_WATER_MARK,
    time::{add_saturating, utc_now},
    SecurityResult,
  },
  security_error, security_log,
};

/// Remembers message nonces (primary signature values) for replay detection.
/// A nonce is kept for the replay window plus the clock skew.
pub struct NonceCache {
  cache: TimeBoundedCache<Vec<u8>, ()>,
  caching_time: Duration,
}

impl NonceCache {
  pub fn new(capacity: usize, caching_time: Duration) -> Self {
    let settings = CacheSettings {
      low_water_mark: DEFAULT_CACHE_LOW_WATER_MARK,
      max_items: capacity,
      purging_mode: PurgingMode::AccessBasedOnly,
      purge_interval: caching_time,
    };
    NonceCache {
      cache: TimeBoundedCache::with_default_hooks(settings),
      caching_time,
    }
  }

  /// Records `nonce`. Returns false if it was already seen.
  pub fn try_add_nonce(&self, nonce: &[u8]) -> SecurityResult<bool> {
    let expiration = add_saturating(utc_now(), self.caching_time);
    self.cache.try_add_item(nonce.to_vec(), (), expiration, false)
  }

  /// Records `nonce`, failing if the message was seen before.
  pub fn check_and_add(&self, nonce: &[u8]) -> SecurityResult<()> {
    if self.try_add_nonce(nonce)? {
      Ok(())
    } else {
      security_log!("Replayed message detected");
      Err(security_error!(
        MessageSecurity,
        "The message has already been processed (replay detected)"
      ))
    }
  }

  pub fn contains(&self, nonce: &[u8]) -> SecurityResult<bool> {
    Ok(self.cache.get_item(&nonce.to_vec())?.is_some())
  }

  pub fn caching_time(&self) -> Duration {
    self.caching_time
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn second_sighting_is_a_replay() {
    let cache = NonceCache::new(10, Duration::from_secs(60));
    cache.check_and_add(b"sig-1").unwrap();
    cache.check_and_add(b"sig-2").unwrap();
    assert!(cache.contains(b"sig-1").unwrap());
    let err = cache.check_and_add(b"sig-1").unwrap_err();
    assert_eq!(err.kind(), crate::security::SecurityErrorKind::MessageSecurity);
  }

  #[test]
  fn full_nonce_cache_refuses() {
    let cache = NonceCache::new(1, Duration::from_secs(60));
    cache.check_and_add(b"a").unwrap();
    assert!(cache.check_and_add(b"b").is_err());
  }
}
