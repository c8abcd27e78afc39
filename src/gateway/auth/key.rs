//! Private key SSH authentication from in-memory key material.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::gateway::error::GatewayError;
use crate::gateway::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Private key authentication strategy.
///
/// The key text comes decrypted from the credential collaborator and is
/// decoded in memory; it never touches disk. Passphrase-less keys only.
pub struct KeyAuth {
    key_material: String,
}

impl KeyAuth {
    pub fn new(key_material: impl Into<String>) -> Self {
        Self {
            key_material: key_material.into(),
        }
    }

    /// Decode the key material into a private key.
    pub(crate) fn decode(&self) -> Result<keys::PrivateKey, GatewayError> {
        keys::decode_secret_key(&self.key_material, None)
            .map_err(|e| GatewayError::Credential(format!("Failed to parse private key: {}", e)))
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        let key_pair = self.decode()?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| GatewayError::Auth(format!("Key authentication failed: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
