use std::{fmt::Debug, time::Duration};

use serde::{Deserialize, Serialize};

use crate::security::types::Property;

// Defaults of the local security settings. Durations are the customary
// WS-SecureConversation service defaults.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TIMESTAMP_VALIDITY_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPLAY_CACHE_SIZE: usize = 900_000;
pub const DEFAULT_ISSUED_TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 60 * 60);
pub const DEFAULT_MAX_CACHED_TOKENS: usize = 1000;
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_STATEFUL_NEGOTIATIONS: usize = 128;
pub const DEFAULT_MAX_PENDING_SESSIONS: usize = 128;
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_KEY_RENEWAL_INTERVAL: Duration = Duration::from_secs(15 * 60 * 60);
pub const DEFAULT_KEY_ROLLOVER_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CACHE_PRUNING_FACTOR: f64 = 0.20;
pub const DEFAULT_CACHE_LOW_WATER_MARK: usize = 50;
pub const DEFAULT_CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_COOKIE_RENEWAL_THRESHOLD_PERCENTAGE: u32 = 60;

/// Tunables of the service (recipient / token issuer) side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalServiceSecuritySettings {
  pub detect_replays: bool,
  pub replay_cache_size: usize,
  pub max_clock_skew: Duration,
  pub replay_window: Duration,
  pub timestamp_validity_duration: Duration,
  pub issued_token_lifetime: Duration,
  pub max_cached_tokens: usize,
  pub negotiation_timeout: Duration,
  pub max_stateful_negotiations: usize,
  pub max_pending_sessions: usize,
  pub inactivity_timeout: Duration,
  pub session_key_renewal_interval: Duration,
  pub session_key_rollover_interval: Duration,
  /// Fraction of the token cache evicted when the cache is full and
  /// eviction of the oldest entries is enabled.
  pub cache_pruning_factor: f64,
  /// Entry count below which access-based purging is skipped.
  pub cache_low_water_mark: usize,
  pub cache_purge_interval: Duration,
}

impl Default for LocalServiceSecuritySettings {
  fn default() -> Self {
    LocalServiceSecuritySettings {
      detect_replays: true,
      replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
      max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
      replay_window: DEFAULT_REPLAY_WINDOW,
      timestamp_validity_duration: DEFAULT_TIMESTAMP_VALIDITY_DURATION,
      issued_token_lifetime: DEFAULT_ISSUED_TOKEN_LIFETIME,
      max_cached_tokens: DEFAULT_MAX_CACHED_TOKENS,
      negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
      max_stateful_negotiations: DEFAULT_MAX_STATEFUL_NEGOTIATIONS,
      max_pending_sessions: DEFAULT_MAX_PENDING_SESSIONS,
      inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
      session_key_renewal_interval: DEFAULT_KEY_RENEWAL_INTERVAL,
      session_key_rollover_interval: DEFAULT_KEY_ROLLOVER_INTERVAL,
      cache_pruning_factor: DEFAULT_CACHE_PRUNING_FACTOR,
      cache_low_water_mark: DEFAULT_CACHE_LOW_WATER_MARK,
      cache_purge_interval: DEFAULT_CACHE_PURGE_INTERVAL,
    }
  }
}

impl LocalServiceSecuritySettings {
  /// Overrides settings from `wssec.*` properties. Unknown property names are
  /// ignored so that one property list can configure several components.
  pub fn apply_properties(&mut self, properties: &[Property]) -> Result<(), ConfigError> {
    for p in properties {
      let value = p.value.as_str();
      match p.name.as_str() {
        "wssec.detect_replays" => self.detect_replays = parse_bool(&p.name, value)?,
        "wssec.replay_cache_size" => self.replay_cache_size = parse_count(&p.name, value)?,
        "wssec.max_clock_skew" => self.max_clock_skew = parse_timespan(&p.name, value)?,
        "wssec.replay_window" => self.replay_window = parse_timespan(&p.name, value)?,
        "wssec.timestamp_validity_duration" => {
          self.timestamp_validity_duration = parse_timespan(&p.name, value)?
        }
        "wssec.issued_token_lifetime" => {
          self.issued_token_lifetime = parse_timespan(&p.name, value)?
        }
        "wssec.max_cached_tokens" => self.max_cached_tokens = parse_count(&p.name, value)?,
        "wssec.negotiation_timeout" => self.negotiation_timeout = parse_timespan(&p.name, value)?,
        "wssec.max_stateful_negotiations" => {
          self.max_stateful_negotiations = parse_count(&p.name, value)?
        }
        "wssec.max_pending_sessions" => self.max_pending_sessions = parse_count(&p.name, value)?,
        "wssec.inactivity_timeout" => self.inactivity_timeout = parse_timespan(&p.name, value)?,
        "wssec.session_key_renewal_interval" => {
          self.session_key_renewal_interval = parse_timespan(&p.name, value)?
        }
        "wssec.session_key_rollover_interval" => {
          self.session_key_rollover_interval = parse_timespan(&p.name, value)?
        }
        "wssec.cache_pruning_factor" => {
          self.cache_pruning_factor = value
            .parse::<f64>()
            .map_err(to_config_error_parse(&p.name))?
        }
        "wssec.cache_low_water_mark" => self.cache_low_water_mark = parse_count(&p.name, value)?,
        "wssec.cache_purge_interval" => {
          self.cache_purge_interval = parse_timespan(&p.name, value)?
        }
        _ => {}
      }
    }
    self.validate()
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    validate_key_intervals(
      self.session_key_renewal_interval,
      self.session_key_rollover_interval,
    )?;
    if !(self.cache_pruning_factor > 0.0 && self.cache_pruning_factor <= 1.0) {
      return Err(security_config_error(format!(
        "Cache pruning factor must be in (0,1], got {}",
        self.cache_pruning_factor
      )));
    }
    if self.max_cached_tokens == 0 {
      return Err(security_config_error(
        "Token cache must hold at least one token".to_owned(),
      ));
    }
    Ok(())
  }
}

/// Tunables of the client (initiator) side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalClientSecuritySettings {
  pub detect_replays: bool,
  pub replay_cache_size: usize,
  pub max_clock_skew: Duration,
  pub replay_window: Duration,
  pub timestamp_validity_duration: Duration,
  pub max_cookie_caching_time: Duration,
  pub cookie_renewal_threshold_percentage: u32,
  pub session_key_renewal_interval: Duration,
  pub session_key_rollover_interval: Duration,
}

impl Default for LocalClientSecuritySettings {
  fn default() -> Self {
    LocalClientSecuritySettings {
      detect_replays: true,
      replay_cache_size: DEFAULT_REPLAY_CACHE_SIZE,
      max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
      replay_window: DEFAULT_REPLAY_WINDOW,
      timestamp_validity_duration: DEFAULT_TIMESTAMP_VALIDITY_DURATION,
      max_cookie_caching_time: Duration::MAX,
      cookie_renewal_threshold_percentage: DEFAULT_COOKIE_RENEWAL_THRESHOLD_PERCENTAGE,
      session_key_renewal_interval: DEFAULT_KEY_RENEWAL_INTERVAL,
      session_key_rollover_interval: DEFAULT_KEY_ROLLOVER_INTERVAL,
    }
  }
}

impl LocalClientSecuritySettings {
  pub fn apply_properties(&mut self, properties: &[Property]) -> Result<(), ConfigError> {
    for p in properties {
      let value = p.value.as_str();
      match p.name.as_str() {
        "wssec.detect_replays" => self.detect_replays = parse_bool(&p.name, value)?,
        "wssec.replay_cache_size" => self.replay_cache_size = parse_count(&p.name, value)?,
        "wssec.max_clock_skew" => self.max_clock_skew = parse_timespan(&p.name, value)?,
        "wssec.replay_window" => self.replay_window = parse_timespan(&p.name, value)?,
        "wssec.timestamp_validity_duration" => {
          self.timestamp_validity_duration = parse_timespan(&p.name, value)?
        }
        "wssec.max_cookie_caching_time" => {
          self.max_cookie_caching_time = parse_timespan(&p.name, value)?
        }
        "wssec.cookie_renewal_threshold_percentage" => {
          let percentage = value
            .parse::<u32>()
            .map_err(to_config_error_parse(&p.name))?;
          if percentage > 100 {
            return Err(parse_config_error(format!(
              "{}: percentage must be at most 100",
              p.name
            )));
          }
          self.cookie_renewal_threshold_percentage = percentage;
        }
        "wssec.session_key_renewal_interval" => {
          self.session_key_renewal_interval = parse_timespan(&p.name, value)?
        }
        "wssec.session_key_rollover_interval" => {
          self.session_key_rollover_interval = parse_timespan(&p.name, value)?
        }
        _ => {}
      }
    }
    self.validate()
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    validate_key_intervals(
      self.session_key_renewal_interval,
      self.session_key_rollover_interval,
    )
  }
}

fn validate_key_intervals(renewal: Duration, rollover: Duration) -> Result<(), ConfigError> {
  if rollover > renewal {
    Err(security_config_error(format!(
      "Key rollover interval {rollover:?} must not exceed key renewal interval {renewal:?}"
    )))
  } else {
    Ok(())
  }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
  value.parse::<bool>().map_err(to_config_error_parse(name))
}

fn parse_count(name: &str, value: &str) -> Result<usize, ConfigError> {
  value.parse::<usize>().map_err(to_config_error_parse(name))
}

/// Parses a time span in `[d.]hh:mm:ss` form, as used in service
/// configuration files.
pub fn parse_timespan(name: &str, value: &str) -> Result<Duration, ConfigError> {
  let (days, clock) = match value.split_once('.') {
    Some((d, rest)) if rest.contains(':') => (
      d.parse::<u64>().map_err(to_config_error_parse(name))?,
      rest,
    ),
    _ => (0, value),
  };
  let fields: Vec<&str> = clock.split(':').collect();
  if fields.len() != 3 {
    return Err(parse_config_error(format!(
      "{name}: expected [d.]hh:mm:ss, got {value:?}"
    )));
  }
  let hours = fields[0]
    .parse::<u64>()
    .map_err(to_config_error_parse(name))?;
  let minutes = fields[1]
    .parse::<u64>()
    .map_err(to_config_error_parse(name))?;
  let seconds = fields[2]
    .parse::<u64>()
    .map_err(to_config_error_parse(name))?;
  if minutes >= 60 || seconds >= 60 {
    return Err(parse_config_error(format!(
      "{name}: minutes and seconds must be below 60, got {value:?}"
    )));
  }
  Ok(Duration::from_secs(
    ((days * 24 + hours) * 60 + minutes) * 60 + seconds,
  ))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Configuration parse error: {0}")]
  Parse(String),
  #[error("Inconsistent security configuration: {0}")]
  Security(String),
  #[error("Configuration error: {0}")]
  Other(String),
}

pub(crate) fn to_config_error_parse<E: Debug + 'static>(
  text: &str,
) -> impl FnOnce(E) -> ConfigError + '_ {
  move |e: E| ConfigError::Parse(format!("{}: {:?}", text, e))
}

pub(crate) fn parse_config_error(text: String) -> ConfigError {
  ConfigError::Parse(text)
}

pub(crate) fn security_config_error(text: String) -> ConfigError {
  ConfigError::Security(text)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_consistent() {
    assert!(LocalServiceSecuritySettings::default().validate().is_ok());
    assert!(LocalClientSecuritySettings::default().validate().is_ok());
    let s = LocalServiceSecuritySettings::default();
    assert_eq!(s.session_key_renewal_interval, Duration::from_secs(54000));
    assert_eq!(s.max_pending_sessions, 128);
    assert_eq!(s.cache_low_water_mark, 50);
  }

  #[test]
  fn timespans_parse() {
    assert_eq!(
      parse_timespan("x", "00:05:00").unwrap(),
      Duration::from_secs(300)
    );
    assert_eq!(
      parse_timespan("x", "1.02:00:01").unwrap(),
      Duration::from_secs(26 * 3600 + 1)
    );
    assert!(parse_timespan("x", "5 minutes").is_err());
    assert!(parse_timespan("x", "00:61:00").is_err());
  }

  #[test]
  fn properties_override_defaults() {
    let mut s = LocalServiceSecuritySettings::default();
    s.apply_properties(&[
      Property::new("wssec.max_clock_skew", "00:00:30"),
      Property::new("wssec.cache_pruning_factor", "0.5"),
      Property::new("unrelated.name", "whatever"),
    ])
    .unwrap();
    assert_eq!(s.max_clock_skew, Duration::from_secs(30));
    assert_eq!(s.cache_pruning_factor, 0.5);
  }

  #[test]
  fn rollover_longer_than_renewal_is_rejected() {
    let mut s = LocalClientSecuritySettings::default();
    let result = s.apply_properties(&[
      Property::new("wssec.session_key_renewal_interval", "00:01:00"),
      Property::new("wssec.session_key_rollover_interval", "00:02:00"),
    ]);
    assert!(matches!(result, Err(ConfigError::Security(_))));
  }

  #[test]
  fn bad_values_are_parse_errors() {
    let mut s = LocalServiceSecuritySettings::default();
    let result = s.apply_properties(&[Property::new("wssec.detect_replays", "maybe")]);
    assert!(matches!(result, Err(ConfigError::Parse(_))));
    let result = s.apply_properties(&[Property::new("wssec.cache_pruning_factor", "1.5")]);
    assert!(matches!(result, Err(ConfigError::Security(_))));
  }
}
