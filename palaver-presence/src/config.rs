//! Engine and avatar-flow configuration.
//!
//! Every field has a default; a JSON file only needs to name what it
//! overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PresenceError;
use crate::path::{PathError, StorePath};

/// Where records live inside the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLayout {
    /// Parent of per-identity presence records (default: `/status`)
    pub status_root: String,
    /// Parent of per-identity profiles (default: `/profiles`)
    pub profiles_root: String,
    /// Connectivity sentinel (default: `/.info/connected`)
    pub connected: String,
    /// Parent of chat messages (default: `/messages`)
    pub messages_root: String,
    /// Parent of chat rooms (default: `/rooms`)
    pub rooms_root: String,
}

impl Default for PathLayout {
    fn default() -> Self {
        Self {
            status_root: "/status".to_string(),
            profiles_root: "/profiles".to_string(),
            connected: "/.info/connected".to_string(),
            messages_root: "/messages".to_string(),
            rooms_root: "/rooms".to_string(),
        }
    }
}

impl PathLayout {
    pub fn status(&self, uid: &str) -> Result<StorePath, PathError> {
        StorePath::new(&self.status_root).child(uid)
    }

    pub fn profile(&self, uid: &str) -> Result<StorePath, PathError> {
        StorePath::new(&self.profiles_root).child(uid)
    }

    pub fn connected(&self) -> StorePath {
        StorePath::new(&self.connected)
    }

    pub fn messages(&self) -> StorePath {
        StorePath::new(&self.messages_root)
    }

    pub fn rooms(&self) -> StorePath {
        StorePath::new(&self.rooms_root)
    }
}

/// Avatar upload settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Accepted MIME types (default: png, jpg, jpeg)
    pub accepted_types: Vec<String>,
    /// Blob directory, one subdirectory per uid (default: `profile`)
    pub blob_root: String,
    /// Object name inside the uid directory (default: `avatar`)
    pub object_name: String,
    /// `max-age` for the uploaded blob (default: 3 days)
    pub cache_max_age_secs: u64,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            accepted_types: vec![
                "image/png".to_string(),
                "image/jpg".to_string(),
                "image/jpeg".to_string(),
            ],
            blob_root: "profile".to_string(),
            object_name: "avatar".to_string(),
            cache_max_age_secs: 3600 * 24 * 3,
        }
    }
}

impl AvatarConfig {
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_max_age_secs)
    }

    pub fn blob_path(&self, uid: &str) -> String {
        format!("{}/{}/{}", self.blob_root.trim_matches('/'), uid, self.object_name)
    }
}

/// Presence engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub paths: PathLayout,
    pub avatar: AvatarConfig,
    /// Buffered notices per subscriber before lagging ones drop (default: 64)
    pub notice_capacity: usize,
    /// Write "offline" before signing out (default: true)
    pub proactive_offline_on_sign_out: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            paths: PathLayout::default(),
            avatar: AvatarConfig::default(),
            notice_capacity: 64,
            proactive_offline_on_sign_out: true,
        }
    }
}

impl PresenceConfig {
    /// Small buffers for tests.
    pub fn for_testing() -> Self {
        Self {
            notice_capacity: 16,
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PresenceError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| PresenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PresenceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PresenceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    fn validate(&self) -> Result<(), PresenceError> {
        if self.notice_capacity == 0 {
            return Err(PresenceError::Config("notice_capacity must be > 0".into()));
        }
        if self.paths.connected().is_root() {
            return Err(PresenceError::Config("connected path must not be the root".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PresenceConfig::default();
        assert_eq!(config.paths.status("u1").unwrap().as_str(), "/status/u1");
        assert_eq!(config.paths.profile("u1").unwrap().as_str(), "/profiles/u1");
        assert_eq!(config.paths.connected().as_str(), "/.info/connected");
        assert_eq!(config.avatar.cache_control(), "public, max-age=259200");
        assert_eq!(config.avatar.blob_path("u1"), "profile/u1/avatar");
        assert!(config.proactive_offline_on_sign_out);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PresenceConfig::from_json_str(
            r#"{ "paths": { "status_root": "/presence" }, "notice_capacity": 8 }"#,
        )
        .unwrap();
        assert_eq!(config.paths.status("u1").unwrap().as_str(), "/presence/u1");
        assert_eq!(config.paths.profiles_root, "/profiles");
        assert_eq!(config.notice_capacity, 8);
        assert_eq!(config.avatar, AvatarConfig::default());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = PresenceConfig::from_json_str(r#"{ "notice_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, PresenceError::Config(_)));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "proactive_offline_on_sign_out": false }}"#).unwrap();
        let config = PresenceConfig::from_json_file(file.path()).unwrap();
        assert!(!config.proactive_offline_on_sign_out);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PresenceConfig::from_json_file(dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("nope.json"));
    }
}
