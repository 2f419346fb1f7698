//! Access credential for the live connection.

use async_trait::async_trait;
use parking_lot::Mutex;

/// Supplies the current access token. `None` is a normal state (signed out,
/// refresh pending); the connection manager waits for the next `connect()`.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// A token held in memory and swapped by the host when it changes.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: Mutex<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.lock() = token;
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn access_token(&self) -> Option<String> {
        self.token.lock().clone()
    }
}
