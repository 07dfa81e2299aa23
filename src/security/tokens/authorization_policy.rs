use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimRight {
  Identity,
  PossessProperty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
  pub claim_type: String,
  pub resource: String,
  pub right: ClaimRight,
}

pub const NAME_CLAIM_TYPE: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name";
pub const THUMBPRINT_CLAIM_TYPE: &str =
  "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/thumbprint";

/// Claims established about the peer by a token authenticator. Evaluating
/// them is the business of the hosting framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationPolicy {
  pub id: String,
  pub issuer: String,
  pub claims: Vec<Claim>,
  pub expiration_time: Option<DateTime<Utc>>,
}

impl AuthorizationPolicy {
  /// Policy with a single identity claim of the given type.
  pub fn identity(
    claim_type: &str,
    resource: impl Into<String>,
    issuer: impl Into<String>,
    expiration_time: Option<DateTime<Utc>>,
  ) -> Self {
    AuthorizationPolicy {
      id: crate::security::types::UniqueId::new().to_string(),
      issuer: issuer.into(),
      claims: vec![Claim {
        claim_type: claim_type.to_string(),
        resource: resource.into(),
        right: ClaimRight::Identity,
      }],
      expiration_time,
    }
  }

  pub fn identity_claim(&self) -> Option<&Claim> {
    self.claims.iter().find(|c| c.right == ClaimRight::Identity)
  }
}

/// The first identity claim resource found in `policies`.
pub fn primary_identity(policies: &[AuthorizationPolicy]) -> Option<&str> {
  policies
    .iter()
    .find_map(|p| p.identity_claim())
    .map(|c| c.resource.as_str())
}
