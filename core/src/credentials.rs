//! Credentials and round-robin assignment

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};

/// Username/password pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Login name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Secret
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Hands out credentials to actors in round-robin order
#[derive(Debug)]
pub struct CredentialPool {
    users: Vec<Credentials>,
    next: AtomicUsize,
}

impl CredentialPool {
    /// Create a pool; at least one credential is required
    pub fn new(users: Vec<Credentials>) -> LoadResult<Self> {
        if users.is_empty() {
            return Err(LoadError::config("credential pool is empty"));
        }
        Ok(Self {
            users,
            next: AtomicUsize::new(0),
        })
    }

    /// Next credential in rotation
    pub fn next(&self) -> Credentials {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.users.len();
        self.users[idx].clone()
    }

    /// Number of distinct credentials
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Always false; construction rejects empty pools
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
