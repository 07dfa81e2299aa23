pub mod authorization_policy;
pub mod key_identifier;
pub mod provider;
pub mod security_context_token;
pub mod security_token;
pub mod token_parameters;

pub use authorization_policy::AuthorizationPolicy;
pub use key_identifier::{KeyIdentifier, KeyIdentifierClause};
pub use provider::{SecurityTokenAuthenticator, SecurityTokenProvider, SecurityTokenResolver};
pub use security_context_token::SecurityContextSecurityToken;
pub use security_token::SecurityToken;
pub use token_parameters::{
  SecurityTokenAttachmentMode, SecurityTokenParameters, SecurityTokenReferenceStyle,
  SupportingTokenSpecification,
};
