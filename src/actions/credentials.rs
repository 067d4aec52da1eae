use async_trait::async_trait;

use crate::AuthError;

/// What the authenticate flow needs to know about an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: i64,
    pub role: String,
    /// PHC-format password hash.
    pub password_hash: String,
}

/// Lookup of stored credentials by login identity.
///
/// Implement this against the application's user table.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Credentials>, AuthError>;
}
