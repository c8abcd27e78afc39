//! Authentication strategies for SSH connections.
//!
//! A trait-based strategy system: each credential kind the gateway receives
//! from the credential collaborator maps to one strategy, and an
//! [`AuthChain`] tries them in order.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: In-memory private key material
//!
//! # Example
//!
//! ```ignore
//! let chain = AuthChain::from_material(&host.auth);
//! let ok = chain.authenticate(&mut handle, "username").await?;
//! ```

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
