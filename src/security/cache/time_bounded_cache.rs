use std::{
  collections::HashMap,
  hash::Hash,
  sync::{Arc, Mutex, RwLock, Weak},
  time::Duration,
};

use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use timer::{Guard, Timer};

use crate::{
  security::{
    time::{add_saturating, to_chrono_duration, utc_now},
    SecurityResult,
  },
  security_error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgingMode {
  /// A background timer sweeps expired entries while the cache is non-empty.
  TimerBased,
  /// Expired entries are swept only when items are added.
  AccessBasedOnly,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
  pub low_water_mark: usize,
  pub max_items: usize,
  pub purging_mode: PurgingMode,
  pub purge_interval: Duration,
}

/// Policy points of a [`TimeBoundedCache`]. Both are called with the cache
/// write lock held, so they must not call back into the cache.
pub trait CacheHooks<K, V>: Send + Sync {
  /// The cache is full even after purging. Returns the keys to evict to make
  /// room. The default refuses, which fails the add.
  fn on_quota_reached(&self, _items: &[(&K, &V, DateTime<Utc>)]) -> SecurityResult<Vec<K>> {
    Err(security_error!(
      QuotaExceeded,
      "The cache has reached its maximum number of items"
    ))
  }

  /// An item left the cache (removed, replaced, evicted or expired).
  fn on_item_removed(&self, _key: &K, _item: V) {}
}

/// Hooks with the default behavior.
pub struct DefaultCacheHooks;

impl<K, V> CacheHooks<K, V> for DefaultCacheHooks {}

struct CacheEntry<V> {
  item: V,
  expiration_time: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
  fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expiration_time <= now
  }
}

struct CacheTable<K, V> {
  entries: HashMap<K, CacheEntry<V>>,
  next_purge_time: DateTime<Utc>,
}

struct CacheShared<K, V> {
  table: RwLock<CacheTable<K, V>>,
  settings: CacheSettings,
  hooks: Box<dyn CacheHooks<K, V>>,
  // Present while the purge timer is scheduled. Dropping it cancels the
  // timer.
  purge_guard: Mutex<Option<Guard>>,
}

impl<K, V> CacheShared<K, V>
where
  K: Eq + Hash + Clone,
{
  // Caller holds the write lock.
  fn purge_stale_items(&self, table: &mut CacheTable<K, V>, now: DateTime<Utc>) -> usize {
    let expired: Vec<K> = table
      .entries
      .iter()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &expired {
      if let Some(entry) = table.entries.remove(key) {
        self.hooks.on_item_removed(key, entry.item);
      }
    }
    table.next_purge_time = add_saturating(now, self.settings.purge_interval);
    if !expired.is_empty() {
      debug!("Purged {} expired cache entries", expired.len());
    }
    expired.len()
  }

  fn should_purge(&self, table: &CacheTable<K, V>, now: DateTime<Utc>) -> bool {
    let count = table.entries.len();
    count >= self.settings.max_items
      || (self.settings.purging_mode == PurgingMode::AccessBasedOnly
        && now >= table.next_purge_time
        && count > self.settings.low_water_mark)
  }

  fn enforce_quota(&self, table: &mut CacheTable<K, V>, now: DateTime<Utc>) -> SecurityResult<()> {
    if table.entries.len() < self.settings.max_items {
      return Ok(());
    }
    let evicted = {
      let items: Vec<(&K, &V, DateTime<Utc>)> = table
        .entries
        .iter()
        .map(|(k, e)| (k, &e.item, e.expiration_time))
        .collect();
      self.hooks.on_quota_reached(&items)?
    };
    for key in &evicted {
      if let Some(entry) = table.entries.remove(key) {
        self.hooks.on_item_removed(key, entry.item);
      }
    }
    if table.entries.len() >= self.settings.max_items {
      Err(security_error!(
        QuotaExceeded,
        "The cache is full ({} items) and no room could be made",
        self.settings.max_items
      ))
    } else {
      trace!("Cache quota enforced at {now}: evicted {}", evicted.len());
      Ok(())
    }
  }

  // Timer callback body.
  fn on_purge_timer(&self) -> SecurityResult<()> {
    let mut guard = self.purge_guard.lock()?;
    let mut table = self.table.write()?;
    self.purge_stale_items(&mut table, utc_now());
    if table.entries.is_empty() {
      // restarted by the next add
      *guard = None;
    }
    Ok(())
  }
}

/// Thread-safe map whose entries expire at a given time, with a quota on the
/// number of entries.
///
/// Readers run concurrently. Every mutation, including the purge and quota
/// enforcement that precede an insert, happens in one write-locked section.
pub struct TimeBoundedCache<K, V> {
  shared: Arc<CacheShared<K, V>>,
  timer: Mutex<Option<Timer>>,
}

impl<K, V> TimeBoundedCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub fn new(settings: CacheSettings, hooks: Box<dyn CacheHooks<K, V>>) -> Self {
    let next_purge_time = add_saturating(utc_now(), settings.purge_interval);
    TimeBoundedCache {
      shared: Arc::new(CacheShared {
        table: RwLock::new(CacheTable {
          entries: HashMap::new(),
          next_purge_time,
        }),
        settings,
        hooks,
        purge_guard: Mutex::new(None),
      }),
      timer: Mutex::new(None),
    }
  }

  pub fn with_default_hooks(settings: CacheSettings) -> Self {
    Self::new(settings, Box::new(DefaultCacheHooks))
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.shared.settings
  }

  /// Adds `item`, or replaces a live entry when `replace_existing` is set.
  /// Returns false if a live entry exists and may not be replaced. Fails
  /// with `QuotaExceeded` when the cache is full and no room could be made.
  pub fn try_add_item(
    &self,
    key: K,
    item: V,
    expiration_time: DateTime<Utc>,
    replace_existing: bool,
  ) -> SecurityResult<bool> {
    let now = utc_now();
    {
      let shared = &self.shared;
      let mut table = shared.table.write()?;
      if shared.should_purge(&table, now) {
        shared.purge_stale_items(&mut table, now);
      }

      let existing_is_live = table
        .entries
        .get(&key)
        .map_or(false, |e| !e.is_expired(now));
      if existing_is_live && !replace_existing {
        return Ok(false);
      }
      if let Some(old) = table.entries.remove(&key) {
        shared.hooks.on_item_removed(&key, old.item);
      } else {
        shared.enforce_quota(&mut table, now)?;
      }
      table.entries.insert(
        key,
        CacheEntry {
          item,
          expiration_time,
        },
      );
    }
    if self.shared.settings.purging_mode == PurgingMode::TimerBased {
      self.ensure_purge_timer()?;
    }
    Ok(true)
  }

  /// Replaces a live entry. Returns false if there is none.
  pub fn try_replace_item(
    &self,
    key: K,
    item: V,
    expiration_time: DateTime<Utc>,
  ) -> SecurityResult<bool> {
    let now = utc_now();
    let mut table = self.shared.table.write()?;
    match table.entries.get_mut(&key) {
      Some(entry) if !entry.is_expired(now) => {
        let old = std::mem::replace(
          entry,
          CacheEntry {
            item,
            expiration_time,
          },
        );
        self.shared.hooks.on_item_removed(&key, old.item);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// A copy of the live item stored under `key`. Expired entries are
  /// reported as absent but stay in the table until the next purge.
  pub fn get_item(&self, key: &K) -> SecurityResult<Option<V>> {
    let now = utc_now();
    let table = self.shared.table.read()?;
    Ok(
      table
        .entries
        .get(key)
        .filter(|e| !e.is_expired(now))
        .map(|e| e.item.clone()),
    )
  }

  pub fn try_remove_item(&self, key: &K) -> SecurityResult<bool> {
    let mut table = self.shared.table.write()?;
    match table.entries.remove(key) {
      Some(entry) => {
        self.shared.hooks.on_item_removed(key, entry.item);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Removes every entry for which `predicate` holds. Returns the number of
  /// removed entries.
  pub fn remove_where<F>(&self, mut predicate: F) -> SecurityResult<usize>
  where
    F: FnMut(&K, &V) -> bool,
  {
    let mut table = self.shared.table.write()?;
    let keys: Vec<K> = table
      .entries
      .iter()
      .filter(|(k, e)| predicate(k, &e.item))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &keys {
      if let Some(entry) = table.entries.remove(key) {
        self.shared.hooks.on_item_removed(key, entry.item);
      }
    }
    Ok(keys.len())
  }

  pub fn clear_items(&self) -> SecurityResult<()> {
    let mut table = self.shared.table.write()?;
    for (key, entry) in table.entries.drain().collect::<Vec<_>>() {
      self.shared.hooks.on_item_removed(&key, entry.item);
    }
    Ok(())
  }

  /// Number of entries, including expired ones not yet purged.
  pub fn count(&self) -> SecurityResult<usize> {
    Ok(self.shared.table.read()?.entries.len())
  }

  /// Copies of all live items.
  pub fn items(&self) -> SecurityResult<Vec<(K, V)>> {
    let now = utc_now();
    let table = self.shared.table.read()?;
    Ok(
      table
        .entries
        .iter()
        .filter(|(_, e)| !e.is_expired(now))
        .map(|(k, e)| (k.clone(), e.item.clone()))
        .collect(),
    )
  }

  /// Sweeps expired entries now. Returns the number of removed entries.
  pub fn purge_stale_items(&self) -> SecurityResult<usize> {
    let mut table = self.shared.table.write()?;
    Ok(self.shared.purge_stale_items(&mut table, utc_now()))
  }

  pub fn is_purge_timer_running(&self) -> SecurityResult<bool> {
    Ok(self.shared.purge_guard.lock()?.is_some())
  }

  fn ensure_purge_timer(&self) -> SecurityResult<()> {
    let mut guard = self.shared.purge_guard.lock()?;
    if guard.is_some() {
      return Ok(());
    }
    let mut timer = self.timer.lock()?;
    let timer = timer.get_or_insert_with(Timer::new);
    let weak: Weak<CacheShared<K, V>> = Arc::downgrade(&self.shared);
    *guard = Some(timer.schedule_repeating(
      to_chrono_duration(self.shared.settings.purge_interval),
      move || {
        if let Some(shared) = weak.upgrade() {
          if let Err(e) = shared.on_purge_timer() {
            error!("Cache purge failed: {e}");
          }
        }
      },
    ));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
  };

  use chrono::Duration as ChronoDuration;

  use super::*;

  fn settings(max_items: usize, purging_mode: PurgingMode) -> CacheSettings {
    CacheSettings {
      low_water_mark: 2,
      max_items,
      purging_mode,
      purge_interval: Duration::from_millis(50),
    }
  }

  struct CountRemovals(Arc<AtomicUsize>);

  impl CacheHooks<u32, String> for CountRemovals {
    fn on_item_removed(&self, _key: &u32, _item: String) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct EvictSmallestKey;

  impl CacheHooks<u32, String> for EvictSmallestKey {
    fn on_quota_reached(&self, items: &[(&u32, &String, DateTime<Utc>)]) -> SecurityResult<Vec<u32>> {
      Ok(items.iter().map(|(k, _, _)| **k).min().into_iter().collect())
    }
  }

  fn later() -> DateTime<Utc> {
    utc_now() + ChronoDuration::hours(1)
  }

  #[test]
  fn add_get_replace_remove() {
    let cache = TimeBoundedCache::with_default_hooks(settings(10, PurgingMode::AccessBasedOnly));
    assert!(cache.try_add_item(1, "a".to_string(), later(), false).unwrap());
    assert!(!cache.try_add_item(1, "b".to_string(), later(), false).unwrap());
    assert_eq!(cache.get_item(&1).unwrap().as_deref(), Some("a"));
    assert!(cache.try_add_item(1, "b".to_string(), later(), true).unwrap());
    assert_eq!(cache.get_item(&1).unwrap().as_deref(), Some("b"));
    assert!(cache.try_replace_item(1, "c".to_string(), later()).unwrap());
    assert!(!cache.try_replace_item(2, "c".to_string(), later()).unwrap());
    assert!(cache.try_remove_item(&1).unwrap());
    assert!(!cache.try_remove_item(&1).unwrap());
    assert_eq!(cache.get_item(&1).unwrap(), None);
  }

  #[test]
  fn expired_items_are_absent_but_replaceable() {
    let removals = Arc::new(AtomicUsize::new(0));
    let cache = TimeBoundedCache::new(
      settings(10, PurgingMode::AccessBasedOnly),
      Box::new(CountRemovals(removals.clone())),
    );
    let past = utc_now() - ChronoDuration::seconds(1);
    cache.try_add_item(1, "old".to_string(), past, false).unwrap();
    assert_eq!(cache.get_item(&1).unwrap(), None);
    assert_eq!(cache.count().unwrap(), 1);
    assert!(cache.try_add_item(1, "new".to_string(), later(), false).unwrap());
    assert_eq!(removals.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_item(&1).unwrap().as_deref(), Some("new"));
  }

  #[test]
  fn default_quota_policy_fails_the_add() {
    let cache = TimeBoundedCache::with_default_hooks(settings(2, PurgingMode::AccessBasedOnly));
    cache.try_add_item(1, "a".to_string(), later(), false).unwrap();
    cache.try_add_item(2, "b".to_string(), later(), false).unwrap();
    let err = cache
      .try_add_item(3, "c".to_string(), later(), false)
      .unwrap_err();
    assert_eq!(err.kind(), crate::security::SecurityErrorKind::QuotaExceeded);
    assert_eq!(cache.count().unwrap(), 2);
  }

  #[test]
  fn full_cache_purges_expired_before_enforcing_quota() {
    let cache = TimeBoundedCache::with_default_hooks(settings(2, PurgingMode::AccessBasedOnly));
    let past = utc_now() - ChronoDuration::seconds(1);
    cache.try_add_item(1, "a".to_string(), past, false).unwrap();
    cache.try_add_item(2, "b".to_string(), later(), false).unwrap();
    assert!(cache.try_add_item(3, "c".to_string(), later(), false).unwrap());
    assert_eq!(cache.count().unwrap(), 2);
  }

  #[test]
  fn quota_hook_can_make_room() {
    let cache = TimeBoundedCache::new(
      settings(2, PurgingMode::AccessBasedOnly),
      Box::new(EvictSmallestKey),
    );
    cache.try_add_item(5, "a".to_string(), later(), false).unwrap();
    cache.try_add_item(7, "b".to_string(), later(), false).unwrap();
    cache.try_add_item(9, "c".to_string(), later(), false).unwrap();
    assert_eq!(cache.get_item(&5).unwrap(), None);
    assert!(cache.get_item(&9).unwrap().is_some());
  }

  #[test]
  fn remove_where_and_clear_notify() {
    let removals = Arc::new(AtomicUsize::new(0));
    let cache = TimeBoundedCache::new(
      settings(10, PurgingMode::AccessBasedOnly),
      Box::new(CountRemovals(removals.clone())),
    );
    for k in 0..4 {
      cache.try_add_item(k, k.to_string(), later(), false).unwrap();
    }
    assert_eq!(cache.remove_where(|k, _| k % 2 == 0).unwrap(), 2);
    assert_eq!(cache.items().unwrap().len(), 2);
    cache.clear_items().unwrap();
    assert_eq!(cache.count().unwrap(), 0);
    assert_eq!(removals.load(Ordering::SeqCst), 4);
  }

  #[test]
  fn purge_timer_sweeps_and_stops_when_empty() {
    let cache = TimeBoundedCache::with_default_hooks(settings(10, PurgingMode::TimerBased));
    let soon = utc_now() + ChronoDuration::milliseconds(20);
    cache.try_add_item(1, "a".to_string(), soon, false).unwrap();
    assert!(cache.is_purge_timer_running().unwrap());

    let mut waited = 0;
    while cache.count().unwrap() > 0 && waited < 100 {
      thread::sleep(Duration::from_millis(20));
      waited += 1;
    }
    assert_eq!(cache.count().unwrap(), 0);
    while cache.is_purge_timer_running().unwrap() && waited < 200 {
      thread::sleep(Duration::from_millis(20));
      waited += 1;
    }
    assert!(!cache.is_purge_timer_running().unwrap());

    cache.try_add_item(2, "b".to_string(), later(), false).unwrap();
    assert!(cache.is_purge_timer_running().unwrap());
  }

  #[test]
  fn concurrent_adds_respect_quota() {
    let cache = Arc::new(TimeBoundedCache::new(
      settings(16, PurgingMode::AccessBasedOnly),
      Box::new(EvictSmallestKey),
    ));
    let handles: Vec<_> = (0..4)
      .map(|t| {
        let cache = cache.clone();
        thread::spawn(move || {
          for i in 0..50 {
            cache
              .try_add_item(t * 100 + i, "x".to_string(), later(), false)
              .unwrap();
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert!(cache.count().unwrap() <= 16);
  }
}
