#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::credentials::{CredentialRepository, Credentials};
use crate::AuthError;
use crate::crypto::PasswordHasher;

#[derive(Clone, Default)]
pub struct MockCredentialRepository {
    pub accounts: Arc<Mutex<Vec<(String, Credentials)>>>,
}

impl MockCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes `password` with `hasher` and stores the account under `identity`.
    pub fn add_account(
        &self,
        hasher: &dyn PasswordHasher,
        identity: &str,
        user_id: i64,
        role: &str,
        password: &str,
    ) -> Credentials {
        let credentials = Credentials {
            user_id,
            role: role.to_owned(),
            password_hash: hasher.hash(password).unwrap(),
        };
        self.accounts
            .lock()
            .unwrap()
            .push((identity.to_lowercase(), credentials.clone()));
        credentials
    }
}

#[async_trait]
impl CredentialRepository for MockCredentialRepository {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Credentials>, AuthError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(identity))
            .map(|(_, c)| c.clone()))
    }
}
