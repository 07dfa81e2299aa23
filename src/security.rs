pub mod algorithm_suite;
pub mod cache;
pub mod channel;
pub mod config;
pub mod cryptographic;
pub mod logging;
pub mod message;
pub mod negotiation;
pub mod protocol;
pub mod session_filter;
pub mod standards;
pub mod time;
pub mod tokens;
pub mod trust;
pub mod types;

pub use types::*;
// export the main entry points
pub use algorithm_suite::SecurityAlgorithmSuite;
pub use config::{ConfigError, LocalClientSecuritySettings, LocalServiceSecuritySettings};
pub use negotiation::{NegotiationTokenAuthenticator, NegotiationTokenProvider};
pub use protocol::{
  SecurityMessageProperty, SecurityProtocol, SecurityProtocolFactory, SecurityProtocolFactoryBuilder,
};
pub use session_filter::SecuritySessionFilter;
pub use standards::SecurityStandardsManager;
