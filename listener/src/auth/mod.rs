//! Bearer token authentication against the identity provider's key set.
//!
//! ```text
//! KeyResolver::resolve() → KeySet (once, at startup) → TokenValidator::validate()
//! ```

pub mod jwks;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

pub use jwks::{KeyResolver, KeySet, KeySetError, SigningKey};
pub use token::{Claims, TokenError, TokenValidator};
