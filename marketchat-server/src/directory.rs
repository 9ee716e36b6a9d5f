//! User directory: the identity resolver boundary.
//!
//! Maps bearer credentials to internal user ids and holds display
//! profiles. In the full marketplace this data lives in the external
//! identity provider; the messaging core only ever performs the two
//! lookups modeled here (credential -> id, id -> profile). Deployments
//! seed the directory from a TOML file, tests register users directly.

use std::collections::HashMap;
use std::path::Path;

use marketchat_proto::ids::UserId;
use marketchat_proto::model::UserProfile;
use tokio::sync::RwLock;

/// Errors that can occur while seeding the directory from a file.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// Failed to read the seed file.
    #[error("failed to read seed file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the seed file as TOML.
    #[error("failed to parse seed file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

/// One user entry in a TOML seed file.
#[derive(Debug, serde::Deserialize)]
struct SeedUser {
    token: String,
    name: String,
    avatar_url: Option<String>,
}

/// Top-level TOML seed file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SeedFile {
    users: Vec<SeedUser>,
}

#[derive(Default)]
struct DirectoryInner {
    /// Credential -> internal id.
    tokens: HashMap<String, UserId>,
    /// Internal id -> display profile.
    profiles: HashMap<UserId, UserProfile>,
}

/// In-memory user directory.
///
/// Thread-safe via [`RwLock`]. Registration mints a fresh [`UserId`];
/// re-registering a credential rebinds it to a new user (matching how the
/// external provider treats a re-issued credential).
#[derive(Default)]
pub struct UserDirectory {
    inner: RwLock<DirectoryInner>,
}

impl UserDirectory {
    /// Creates a new, empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user under the given credential, returning the profile.
    pub async fn register(
        &self,
        token: &str,
        name: &str,
        avatar_url: Option<String>,
    ) -> UserProfile {
        let profile = UserProfile {
            id: UserId::new(),
            name: name.to_string(),
            avatar_url,
        };
        let mut inner = self.inner.write().await;
        inner.tokens.insert(token.to_string(), profile.id);
        inner.profiles.insert(profile.id, profile.clone());
        drop(inner);
        profile
    }

    /// Resolves a bearer credential to an internal user id.
    pub async fn resolve(&self, token: &str) -> Option<UserId> {
        let inner = self.inner.read().await;
        inner.tokens.get(token).copied()
    }

    /// Looks up a user's display profile.
    pub async fn profile(&self, user: UserId) -> Option<UserProfile> {
        let inner = self.inner.read().await;
        inner.profiles.get(&user).cloned()
    }

    /// Returns `true` if `user` exists in the directory.
    pub async fn exists(&self, user: UserId) -> bool {
        let inner = self.inner.read().await;
        inner.profiles.contains_key(&user)
    }

    /// Looks up profiles for a set of users, substituting a placeholder
    /// for any id the directory no longer knows.
    pub async fn profiles(&self, users: &[UserId]) -> Vec<UserProfile> {
        let inner = self.inner.read().await;
        users
            .iter()
            .map(|id| {
                inner.profiles.get(id).cloned().unwrap_or(UserProfile {
                    id: *id,
                    name: "unknown".to_string(),
                    avatar_url: None,
                })
            })
            .collect()
    }

    /// Seeds the directory from a TOML file of `[[users]]` entries.
    ///
    /// Returns the number of users registered.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] if the file cannot be read or parsed.
    pub async fn load_seed(&self, path: &Path) -> Result<usize, SeedError> {
        let contents = std::fs::read_to_string(path).map_err(|e| SeedError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let seed: SeedFile = toml::from_str(&contents)?;
        let count = seed.users.len();
        for user in seed.users {
            self.register(&user.token, &user.name, user.avatar_url).await;
        }
        Ok(count)
    }
}
