//! Authentication chain for trying multiple strategies.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::gateway::error::GatewayError;
use crate::gateway::session::SshClientHandler;
use crate::gateway::types::AuthMaterial;

use super::traits::AuthStrategy;
use super::{KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// The first successful authentication stops the chain.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build a chain from decrypted host credentials: password first, then
    /// key material. Empty values are skipped.
    pub fn from_material(material: &AuthMaterial) -> Self {
        let mut chain = Self::new();
        if let Some(password) = material.password.as_deref().filter(|p| !p.is_empty()) {
            chain = chain.with_password(password);
        }
        if let Some(key) = material.private_key.as_deref().filter(|k| !k.is_empty()) {
            chain = chain.with_key(key);
        }
        chain
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_material: impl Into<String>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_material)));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        if self.strategies.is_empty() {
            return Err(GatewayError::Credential(
                "No authentication method provided".to_string(),
            ));
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    last_error = Some(GatewayError::Auth(format!(
                        "{} authentication rejected",
                        strategy.name()
                    )));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::Auth("All authentication methods failed".to_string())
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_chain_empty() {
        let chain = AuthChain::new();
        assert!(chain.names().is_empty());
    }

    #[test]
    fn test_from_material_orders_password_before_key() {
        let material = AuthMaterial {
            password: Some("pw".into()),
            private_key: Some("key".into()),
        };
        let chain = AuthChain::from_material(&material);
        assert_eq!(chain.names(), vec!["password", "key"]);
    }

    #[test]
    fn test_from_material_skips_empty_values() {
        let material = AuthMaterial {
            password: Some(String::new()),
            private_key: Some("key".into()),
        };
        let chain = AuthChain::from_material(&material);
        assert_eq!(chain.names(), vec!["key"]);
    }

    #[test]
    fn test_from_empty_material_is_empty() {
        assert!(AuthChain::from_material(&AuthMaterial::default()).names().is_empty());
    }

    #[test]
    fn test_chain_name() {
        assert_eq!(AuthChain::new().name(), "chain");
    }
}
