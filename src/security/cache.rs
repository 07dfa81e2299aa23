pub mod nonce_cache;
pub mod security_context_token_cache;
pub mod time_bounded_cache;

pub use nonce_cache::NonceCache;
pub use security_context_token_cache::{
  ContextCacheKey, ContextCacheOptions, SecurityContextTokenCache,
};
pub use time_bounded_cache::{CacheHooks, CacheSettings, PurgingMode, TimeBoundedCache};
