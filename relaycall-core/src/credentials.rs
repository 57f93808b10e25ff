use crate::config::CredentialsConfig;
use crate::error::{Error, Result};
use crate::models::Credentials;
use crate::traits::CredentialStore;

/// Serves credentials taken from configuration
#[derive(Debug, Clone)]
pub struct StaticCredentialStore {
    credentials: Credentials,
}

impl StaticCredentialStore {
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    #[must_use]
    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self::new(Credentials {
            api_key: config.api_key.clone(),
            id: config.id.clone(),
            name: config.name.clone(),
            email: config.email.clone(),
        })
    }
}

impl CredentialStore for StaticCredentialStore {
    fn load(&self) -> Result<Credentials> {
        if self.credentials.api_key.is_empty() {
            return Err(Error::Credentials("api key is not set".to_string()));
        }
        Ok(self.credentials.clone())
    }
}
