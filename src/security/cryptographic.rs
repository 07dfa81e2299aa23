// Cryptographic primitives behind the algorithm suite. Everything above this
// module talks about tokens and algorithm URIs; only these files touch ring
// and rsa directly.
pub mod aes_gcm;
pub mod digest;
pub mod psha1;
pub mod rsa_key;
pub mod signing;
pub mod symmetric_key;

pub use symmetric_key::SymmetricKey;
