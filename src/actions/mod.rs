mod authenticate;
mod credentials;

#[cfg(any(test, feature = "mocks"))]
mod credentials_mock;

pub use authenticate::AuthenticateAction;
pub use credentials::{CredentialRepository, Credentials};

#[cfg(any(test, feature = "mocks"))]
pub use credentials_mock::MockCredentialRepository;
