use std::time::Duration;

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    cache::time_bounded_cache::{CacheHooks, CacheSettings, PurgingMode, TimeBoundedCache},
    config::{
      LocalServiceSecuritySettings, DEFAULT_CACHE_LOW_WATER_MARK, DEFAULT_CACHE_PRUNING_FACTOR,
      DEFAULT_CACHE_PURGE_INTERVAL, DEFAULT_MAX_CACHED_TOKENS, DEFAULT_MAX_CLOCK_SKEW,
    },
    time::{add_saturating, sub_saturating, utc_now},
    tokens::SecurityContextSecurityToken,
    types::UniqueId,
    SecurityResult,
  },
  security_error, security_log,
};

/// Context id, plus the key generation for renewed contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextCacheKey {
  pub context_id: UniqueId,
  pub generation: Option<UniqueId>,
}

impl ContextCacheKey {
  pub fn new(context_id: UniqueId, generation: Option<UniqueId>) -> Self {
    ContextCacheKey {
      context_id,
      generation,
    }
  }

  pub fn for_token(token: &SecurityContextSecurityToken) -> Self {
    Self::new(token.context_id().clone(), token.key_generation().cloned())
  }
}

#[derive(Debug, Clone)]
pub struct ContextCacheOptions {
  pub capacity: usize,
  /// Evict the oldest tokens when full, instead of refusing new ones.
  pub replace_oldest_entries: bool,
  pub clock_skew: Duration,
  pub pruning_factor: f64,
  pub low_water_mark: usize,
  pub purge_interval: Duration,
  pub purging_mode: PurgingMode,
}

impl Default for ContextCacheOptions {
  fn default() -> Self {
    ContextCacheOptions {
      capacity: DEFAULT_MAX_CACHED_TOKENS,
      replace_oldest_entries: true,
      clock_skew: DEFAULT_MAX_CLOCK_SKEW,
      pruning_factor: DEFAULT_CACHE_PRUNING_FACTOR,
      low_water_mark: DEFAULT_CACHE_LOW_WATER_MARK,
      purge_interval: DEFAULT_CACHE_PURGE_INTERVAL,
      purging_mode: PurgingMode::TimerBased,
    }
  }
}

impl ContextCacheOptions {
  pub fn from_service_settings(
    settings: &LocalServiceSecuritySettings,
    replace_oldest_entries: bool,
  ) -> Self {
    ContextCacheOptions {
      capacity: settings.max_cached_tokens,
      replace_oldest_entries,
      clock_skew: settings.max_clock_skew,
      pruning_factor: settings.cache_pruning_factor,
      low_water_mark: settings.cache_low_water_mark,
      purge_interval: settings.cache_purge_interval,
      purging_mode: PurgingMode::TimerBased,
    }
  }
}

pub type ContextRemovedCallback = dyn Fn(&SecurityContextSecurityToken) + Send + Sync;

struct ContextCacheHooks {
  replace_oldest_entries: bool,
  pruning_factor: f64,
  on_removed: Option<Box<ContextRemovedCallback>>,
}

impl CacheHooks<ContextCacheKey, SecurityContextSecurityToken> for ContextCacheHooks {
  fn on_quota_reached(
    &self,
    items: &[(&ContextCacheKey, &SecurityContextSecurityToken, DateTime<Utc>)],
  ) -> SecurityResult<Vec<ContextCacheKey>> {
    if !self.replace_oldest_entries {
      security_log!("Security context token cache is full, refusing new token");
      return Err(security_error!(
        QuotaExceeded,
        "The security context token cache is full ({} tokens)",
        items.len()
      ));
    }
    let mut by_age: Vec<_> = items.iter().collect();
    by_age.sort_by_key(|(_, token, _)| (token.valid_from(), token.key_effective_time()));
    let mut pruning_amount = (items.len() as f64 * self.pruning_factor) as usize;
    if pruning_amount == 0 {
      pruning_amount = items.len();
    }
    security_log!(
      "Security context token cache is full, evicting {} oldest of {} tokens",
      pruning_amount,
      items.len()
    );
    Ok(
      by_age
        .into_iter()
        .take(pruning_amount)
        .map(|(key, _, _)| (*key).clone())
        .collect(),
    )
  }

  fn on_item_removed(&self, _key: &ContextCacheKey, mut token: SecurityContextSecurityToken) {
    token.dispose();
    if let Some(callback) = &self.on_removed {
      callback(&token);
    }
  }
}

/// Session tokens by context id and key generation.
///
/// Tokens are cloned on the way in and on the way out. Every token that
/// leaves the cache has its cached copy disposed.
pub struct SecurityContextTokenCache {
  cache: TimeBoundedCache<ContextCacheKey, SecurityContextSecurityToken>,
  clock_skew: Duration,
}

impl SecurityContextTokenCache {
  pub fn new(options: ContextCacheOptions) -> Self {
    Self::build(options, None)
  }

  /// Like `new`, with `callback` invoked for every token that leaves the
  /// cache, after it has been disposed.
  pub fn with_removal_callback(
    options: ContextCacheOptions,
    callback: Box<ContextRemovedCallback>,
  ) -> Self {
    Self::build(options, Some(callback))
  }

  fn build(options: ContextCacheOptions, on_removed: Option<Box<ContextRemovedCallback>>) -> Self {
    let settings = CacheSettings {
      low_water_mark: options.low_water_mark,
      max_items: options.capacity,
      purging_mode: options.purging_mode,
      purge_interval: options.purge_interval,
    };
    let hooks = ContextCacheHooks {
      replace_oldest_entries: options.replace_oldest_entries,
      pruning_factor: options.pruning_factor,
      on_removed,
    };
    SecurityContextTokenCache {
      cache: TimeBoundedCache::new(settings, Box::new(hooks)),
      clock_skew: options.clock_skew,
    }
  }

  fn validate_not_expired(&self, token: &SecurityContextSecurityToken) -> SecurityResult<()> {
    let now = utc_now();
    let horizon = sub_saturating(now, self.clock_skew);
    if token.valid_to() < horizon || token.key_expiration_time() < horizon {
      return Err(security_error!(
        Argument,
        "Security context token {} has expired and cannot be cached",
        token.context_id()
      ));
    }
    Ok(())
  }

  fn expiration_of(&self, token: &SecurityContextSecurityToken) -> DateTime<Utc> {
    // kept around for the clock skew so that a peer slightly behind can
    // still use it
    add_saturating(token.expiration_time(), self.clock_skew)
  }

  /// Caches a copy of `token`. Returns false if a live token with the same
  /// context id and generation is already cached.
  pub fn try_add_context(&self, token: &SecurityContextSecurityToken) -> SecurityResult<bool> {
    self.validate_not_expired(token)?;
    let added = self.cache.try_add_item(
      ContextCacheKey::for_token(token),
      token.clone(),
      self.expiration_of(token),
      false,
    )?;
    if added {
      debug!(
        "Cached security context {} (generation {:?})",
        token.context_id(),
        token.key_generation()
      );
    }
    Ok(added)
  }

  /// Like `try_add_context`, but a duplicate is an error.
  pub fn add_context(&self, token: &SecurityContextSecurityToken) -> SecurityResult<()> {
    if self.try_add_context(token)? {
      Ok(())
    } else {
      Err(security_error!(
        InvalidOperation,
        "Security context {} is already cached",
        token.context_id()
      ))
    }
  }

  /// A copy of the cached token, if present and not expired.
  pub fn get_context(
    &self,
    context_id: &UniqueId,
    generation: Option<&UniqueId>,
  ) -> SecurityResult<Option<SecurityContextSecurityToken>> {
    self
      .cache
      .get_item(&ContextCacheKey::new(context_id.clone(), generation.cloned()))
  }

  pub fn remove_context(
    &self,
    context_id: &UniqueId,
    generation: Option<&UniqueId>,
  ) -> SecurityResult<bool> {
    self
      .cache
      .try_remove_item(&ContextCacheKey::new(context_id.clone(), generation.cloned()))
  }

  /// Removes every generation of the context.
  pub fn remove_all_contexts(&self, context_id: &UniqueId) -> SecurityResult<usize> {
    let removed = self
      .cache
      .remove_where(|key, _| &key.context_id == context_id)?;
    if removed > 0 {
      security_log!("Removed {removed} key generation(s) of security context {context_id}");
    }
    Ok(removed)
  }

  /// Copies of every live generation of the context.
  pub fn get_all_contexts(
    &self,
    context_id: &UniqueId,
  ) -> SecurityResult<Vec<SecurityContextSecurityToken>> {
    Ok(
      self
        .cache
        .items()?
        .into_iter()
        .filter(|(key, _)| &key.context_id == context_id)
        .map(|(_, token)| token)
        .collect(),
    )
  }

  pub fn clear(&self) -> SecurityResult<()> {
    self.cache.clear_items()
  }

  pub fn count(&self) -> SecurityResult<usize> {
    self.cache.count()
  }

  pub fn clock_skew(&self) -> Duration {
    self.clock_skew
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  };

  use chrono::Duration as ChronoDuration;

  use super::*;
  use crate::security::{cryptographic::SymmetricKey, SecurityErrorKind};

  fn token_valid_from(valid_from: DateTime<Utc>) -> SecurityContextSecurityToken {
    SecurityContextSecurityToken::new(
      UniqueId::new(),
      "_sct",
      SymmetricKey::generate_random(32),
      valid_from,
      utc_now() + ChronoDuration::hours(1),
      vec![],
    )
  }

  fn options(capacity: usize, replace_oldest_entries: bool) -> ContextCacheOptions {
    ContextCacheOptions {
      capacity,
      replace_oldest_entries,
      purging_mode: PurgingMode::AccessBasedOnly,
      ..ContextCacheOptions::default()
    }
  }

  #[test]
  fn expired_tokens_are_rejected_before_insertion() {
    let cache = SecurityContextTokenCache::new(options(10, true));
    let now = utc_now();
    let expired = SecurityContextSecurityToken::new(
      UniqueId::new(),
      "_old",
      SymmetricKey::generate_random(32),
      now - ChronoDuration::hours(2),
      now - ChronoDuration::hours(1),
      vec![],
    );
    let err = cache.try_add_context(&expired).unwrap_err();
    assert_eq!(err.kind(), SecurityErrorKind::Argument);
    assert_eq!(cache.count().unwrap(), 0);

    // within clock skew is still acceptable
    let barely = SecurityContextSecurityToken::new(
      UniqueId::new(),
      "_barely",
      SymmetricKey::generate_random(32),
      now - ChronoDuration::hours(1),
      now - ChronoDuration::seconds(10),
      vec![],
    );
    assert!(cache.try_add_context(&barely).unwrap());

    // expired key window alone is enough to reject
    let key_expired = token_valid_from(now).with_key_generation(
      UniqueId::new(),
      now - ChronoDuration::hours(2),
      now - ChronoDuration::hours(1),
    );
    assert!(cache.try_add_context(&key_expired).is_err());
  }

  #[test]
  fn cached_copies_are_independent() {
    let cache = SecurityContextTokenCache::new(options(10, true));
    let mut token = token_valid_from(utc_now());
    cache.add_context(&token).unwrap();
    token.dispose();
    let cached = cache.get_context(token.context_id(), None).unwrap().unwrap();
    assert!(!cached.is_disposed());
    assert!(cache.add_context(&cached).is_err());
  }

  #[test]
  fn quota_evicts_oldest_fraction_and_disposes_each_once() {
    let disposed = Arc::new(Mutex::new(Vec::new()));
    let seen = disposed.clone();
    let cache = SecurityContextTokenCache::with_removal_callback(
      options(10, true),
      Box::new(move |token| {
        assert!(token.is_disposed());
        seen.lock().unwrap().push(token.context_id().clone());
      }),
    );
    let base = utc_now() - ChronoDuration::minutes(30);
    let tokens: Vec<_> = (0..10)
      .map(|i| token_valid_from(base + ChronoDuration::minutes(i)))
      .collect();
    for t in &tokens {
      assert!(cache.try_add_context(t).unwrap());
    }
    let newest = token_valid_from(utc_now());
    assert!(cache.try_add_context(&newest).unwrap());

    // floor(10 * 0.2) = 2 oldest
    let evicted = disposed.lock().unwrap().clone();
    assert_eq!(evicted, vec![tokens[0].context_id().clone(), tokens[1].context_id().clone()]);
    assert_eq!(cache.count().unwrap(), 9);
    assert!(cache.get_context(tokens[0].context_id(), None).unwrap().is_none());
    assert!(cache.get_context(tokens[2].context_id(), None).unwrap().is_some());
  }

  #[test]
  fn small_cache_evicts_everything() {
    let removed = Arc::new(AtomicUsize::new(0));
    let counter = removed.clone();
    let cache = SecurityContextTokenCache::with_removal_callback(
      options(3, true),
      Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
      }),
    );
    for _ in 0..3 {
      cache.try_add_context(&token_valid_from(utc_now())).unwrap();
    }
    // floor(3 * 0.2) = 0, so the whole cache goes
    cache.try_add_context(&token_valid_from(utc_now())).unwrap();
    assert_eq!(removed.load(Ordering::SeqCst), 3);
    assert_eq!(cache.count().unwrap(), 1);
  }

  #[test]
  fn full_cache_without_replacement_fails() {
    let cache = SecurityContextTokenCache::new(options(1, false));
    cache.try_add_context(&token_valid_from(utc_now())).unwrap();
    let err = cache
      .try_add_context(&token_valid_from(utc_now()))
      .unwrap_err();
    assert_eq!(err.kind(), SecurityErrorKind::QuotaExceeded);
  }

  #[test]
  fn generations_are_kept_apart() {
    let cache = SecurityContextTokenCache::new(options(10, true));
    let now = utc_now();
    let first = token_valid_from(now).with_key_generation(
      UniqueId::new(),
      now,
      now + ChronoDuration::minutes(30),
    );
    let second = first.renew(
      SymmetricKey::generate_random(32),
      now,
      now + ChronoDuration::hours(1),
    );
    cache.add_context(&first).unwrap();
    cache.add_context(&second).unwrap();
    assert_eq!(cache.get_all_contexts(first.context_id()).unwrap().len(), 2);
    assert!(cache
      .get_context(first.context_id(), second.key_generation())
      .unwrap()
      .is_some());
    assert!(cache.get_context(first.context_id(), None).unwrap().is_none());

    assert!(cache
      .remove_context(first.context_id(), first.key_generation())
      .unwrap());
    assert_eq!(cache.remove_all_contexts(first.context_id()).unwrap(), 1);
    assert_eq!(cache.count().unwrap(), 0);
  }
}
