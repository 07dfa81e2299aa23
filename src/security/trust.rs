pub mod elements;
pub mod rst;
pub mod rstr;

pub use elements::{
  compute_combined_key, BinaryExchange, Lifetime, RequestType, RequestedProofToken,
  RequestedSecurityToken, SecurityKeyEntropyMode,
};
pub use rst::RequestSecurityToken;
pub use rstr::{RequestSecurityTokenResponse, RequestSecurityTokenResponseCollection};
