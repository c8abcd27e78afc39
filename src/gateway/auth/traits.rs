//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::gateway::error::GatewayError;
use crate::gateway::session::SshClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials rejected
    /// * `Err(_)` - Error during the attempt (unusable key, transport failure)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, GatewayError>;

    /// Name of this strategy, for logging.
    fn name(&self) -> &'static str;
}
