//! Persisted user profiles.
//!
//! A [`UserProfile`] is a named identity with a color tag and a credential
//! header set. Profiles attribute discovered identifiers in the resource
//! index and supply the headers an outer transport injects into proxied
//! requests. The store is a process-wide singleton with process lifetime;
//! every mutation rewrites `~/.mcp-inspector/auth.json` in full.
//!
//! # Disk Format
//!
//! ```text
//! {
//!   "profiles": [
//!     {"id": "…", "displayName": "Alice", "colorTag": "blue",
//!      "headers": {"Authorization": "Bearer …"},
//!      "createdAt": 1754006400000, "updatedAt": 1754006400000}
//!   ],
//!   "activeProfileId": "…"
//! }
//! ```
//!
//! Writes go to a sibling `.tmp` file which is then renamed over the target,
//! so a crash mid-write never leaves a truncated store behind. A missing
//! file is a fresh start; a malformed file is logged and treated as empty
//! without being overwritten until the next successful save.

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory under the user's home where both stores live.
pub const CONFIG_DIR_NAME: &str = ".mcp-inspector";
const AUTH_FILE_NAME: &str = "auth.json";

/// Closed set of profile color tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorTag {
    Blue,
    Red,
    Green,
    Purple,
    Orange,
    Yellow,
}

/// A persisted identity used to attribute discovered resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// UUIDv4, assigned at creation.
    pub id: String,
    pub display_name: String,
    pub color_tag: ColorTag,
    /// Opaque authorization string, e.g. a bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
    /// Arbitrary headers injected into proxied requests by the transport layer.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last mutation time, epoch milliseconds.
    pub updated_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthFile {
    #[serde(default)]
    profiles: Vec<UserProfile>,
    #[serde(default)]
    active_profile_id: Option<String>,
}

/// Store of user profiles plus the optional active selection.
pub struct ProfileStore {
    profiles: Vec<UserProfile>,
    active_profile_id: Option<String>,
    file_path: PathBuf,
}

impl ProfileStore {
    /// Open the store backed by `auth.json` under `~/.mcp-inspector/`.
    ///
    /// Falls back to the current directory when no home directory can be
    /// resolved (containers, stripped-down CI environments).
    pub fn open_default() -> Self {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME);
        Self::open(dir.join(AUTH_FILE_NAME))
    }

    /// Open the store backed by an explicit file path.
    pub fn open(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let loaded = match fs::read_to_string(&file_path) {
            Ok(raw) => match serde_json::from_str::<AuthFile>(&raw) {
                Ok(file) => file,
                Err(err) => {
                    warn!(
                        "profile store {} is malformed ({}); starting empty",
                        file_path.display(),
                        err
                    );
                    AuthFile::default()
                }
            },
            Err(_) => AuthFile::default(),
        };

        Self {
            profiles: loaded.profiles,
            active_profile_id: loaded.active_profile_id,
            file_path,
        }
    }

    /// Create and persist a new profile; returns the stored entry.
    pub fn create_profile(
        &mut self,
        display_name: impl Into<String>,
        color_tag: ColorTag,
    ) -> Result<UserProfile, Box<dyn Error + Send + Sync>> {
        let now = Utc::now().timestamp_millis();
        let profile = UserProfile {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            color_tag,
            authorization: None,
            headers: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.profiles.push(profile.clone());
        self.save()?;
        Ok(profile)
    }

    /// Apply `update` to the profile with `id`, bump `updated_at`, persist.
    ///
    /// Returns the updated profile, or `None` when the id is unknown.
    pub fn update_profile<F>(
        &mut self,
        id: &str,
        update: F,
    ) -> Result<Option<UserProfile>, Box<dyn Error + Send + Sync>>
    where
        F: FnOnce(&mut UserProfile),
    {
        let updated = match self.profiles.iter_mut().find(|p| p.id == id) {
            Some(profile) => {
                update(profile);
                profile.updated_at = Utc::now().timestamp_millis();
                Some(profile.clone())
            }
            None => None,
        };
        if updated.is_some() {
            self.save()?;
        }
        Ok(updated)
    }

    /// Remove a profile. Clears the active selection if it pointed there.
    pub fn delete_profile(&mut self, id: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let before = self.profiles.len();
        self.profiles.retain(|p| p.id != id);
        if self.profiles.len() == before {
            return Ok(false);
        }
        if self.active_profile_id.as_deref() == Some(id) {
            self.active_profile_id = None;
        }
        self.save()?;
        Ok(true)
    }

    /// Select the acting profile. `None` clears the selection; an unknown id
    /// is rejected.
    pub fn set_active(
        &mut self,
        id: Option<&str>,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        match id {
            Some(id) if !self.profiles.iter().any(|p| p.id == id) => Ok(false),
            _ => {
                self.active_profile_id = id.map(str::to_string);
                self.save()?;
                Ok(true)
            }
        }
    }

    /// The currently selected profile, if any.
    pub fn active_profile(&self) -> Option<&UserProfile> {
        let id = self.active_profile_id.as_deref()?;
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn active_profile_id(&self) -> Option<&str> {
        self.active_profile_id.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&UserProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn list(&self) -> &[UserProfile] {
        &self.profiles
    }

    /// Serialize the full store and rename it over the backing file.
    fn save(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let file = AuthFile {
            profiles: self.profiles.clone(),
            active_profile_id: self.active_profile_id.clone(),
        };
        write_json_atomically(&self.file_path, &file)
    }
}

/// Serialize `value` to `path` via a temp file plus rename.
///
/// Shared by the profile store and the resource indexer so neither ever
/// truncates its backing file in place.
pub(crate) fn write_json_atomically<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
