//! Avatar upload flow.
//!
//! A single selected image is uploaded to the blob store, then its download
//! URL is fanned out to every denormalised copy of the user's avatar in one
//! atomic multi-path update:
//!
//! ```text
//! /profiles/{uid}/avatar
//! /messages/{mid}/author/avatar                 where author.uid == uid
//! /rooms/{rid}/lastMessage/author/avatar        where lastMessage.author.uid == uid
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{AvatarConfig, PathLayout, PresenceConfig};
use crate::error::StoreError;
use crate::path::{validate_key, PathError, StorePath};
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("Blob store unavailable: {0}")]
    Unavailable(String),
    #[error("Upload rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    #[error("No file selected")]
    NoSelection,
    #[error("Expected a single file, got {0}")]
    MultipleFiles(usize),
    #[error("Wrong file type {0}")]
    UnsupportedType(String),
    #[error("File is empty")]
    EmptyFile,
    #[error("Upload failed: {0}")]
    Blob(#[from] BlobError),
    #[error("Profile update failed: {0}")]
    Store(#[from] StoreError),
    #[error("Invalid key: {0}")]
    Path(#[from] PathError),
}

/// Metadata attached to an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub content_type: String,
    pub cache_control: String,
}

/// Binary object storage returning download URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        metadata: UploadMetadata,
    ) -> Result<String, BlobError>;
}

/// A file picked by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AvatarFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Accept exactly one file of an allowed type.
pub fn select_file(mut files: Vec<AvatarFile>, config: &AvatarConfig) -> Result<AvatarFile, AvatarError> {
    match files.len() {
        0 => return Err(AvatarError::NoSelection),
        1 => {}
        n => return Err(AvatarError::MultipleFiles(n)),
    }
    let file = files.remove(0);
    check_type(&file, config)?;
    Ok(file)
}

fn check_type(file: &AvatarFile, config: &AvatarConfig) -> Result<(), AvatarError> {
    if !config.accepted_types.iter().any(|t| *t == file.content_type) {
        return Err(AvatarError::UnsupportedType(file.content_type.clone()));
    }
    if file.bytes.is_empty() {
        return Err(AvatarError::EmptyFile);
    }
    Ok(())
}

/// Multi-path update setting `key` to `value` on the profile and on every
/// denormalised copy of the author.
pub async fn user_updates(
    store: &dyn SessionStore,
    paths: &PathLayout,
    uid: &str,
    key: &str,
    value: Value,
) -> Result<BTreeMap<StorePath, Value>, AvatarError> {
    let mut updates = BTreeMap::new();
    updates.insert(paths.profile(uid)?.child(key)?, value.clone());

    let messages_root = paths.messages();
    if let Some(Value::Object(messages)) = store.read(&messages_root).await? {
        for (mid, message) in &messages {
            if author_uid(message.get("author")) == Some(uid) {
                let path = messages_root.child(mid)?.join_unchecked("author").child(key)?;
                updates.insert(path, value.clone());
            }
        }
    }

    let rooms_root = paths.rooms();
    if let Some(Value::Object(rooms)) = store.read(&rooms_root).await? {
        for (rid, room) in &rooms {
            let author = room.get("lastMessage").and_then(|m| m.get("author"));
            if author_uid(author) == Some(uid) {
                let path = rooms_root
                    .child(rid)?
                    .join_unchecked("lastMessage/author")
                    .child(key)?;
                updates.insert(path, value.clone());
            }
        }
    }

    Ok(updates)
}

fn author_uid(author: Option<&Value>) -> Option<&str> {
    author?.get("uid")?.as_str()
}

/// Uploads avatars and propagates the resulting URL.
pub struct AvatarUploader {
    store: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
    config: PresenceConfig,
}

impl AvatarUploader {
    pub fn new(store: Arc<dyn SessionStore>, blobs: Arc<dyn BlobStore>, config: PresenceConfig) -> Self {
        Self {
            store,
            blobs,
            config,
        }
    }

    /// Upload `file` as the avatar of `uid` and return its download URL.
    pub async fn upload(&self, uid: &str, file: AvatarFile) -> Result<String, AvatarError> {
        validate_key(uid)?;
        let avatar = &self.config.avatar;
        check_type(&file, avatar)?;

        let metadata = UploadMetadata {
            content_type: file.content_type.clone(),
            cache_control: avatar.cache_control(),
        };
        let blob_path = avatar.blob_path(uid);
        let url = self.blobs.upload(&blob_path, file.bytes, metadata).await?;

        let updates = user_updates(
            self.store.as_ref(),
            &self.config.paths,
            uid,
            "avatar",
            Value::String(url.clone()),
        )
        .await?;
        let fanned = updates.len();
        self.store.update(updates).await?;

        log::info!("avatar: '{uid}' updated ({fanned} path(s))");
        Ok(url)
    }
}

/// Blob held by [`MemoryBlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub metadata: UploadMetadata,
    pub token: Uuid,
}

/// In-process blob store.
pub struct MemoryBlobStore {
    base_url: String,
    objects: RwLock<HashMap<String, StoredBlob>>,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub async fn get(&self, path: &str) -> Option<StoredBlob> {
        self.objects.read().await.get(path).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        metadata: UploadMetadata,
    ) -> Result<String, BlobError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(BlobError::Unavailable("memory blob store offline".into()));
        }
        if path.is_empty() {
            return Err(BlobError::Rejected("empty object path".into()));
        }
        let token = Uuid::new_v4();
        self.objects.write().await.insert(
            path.to_string(),
            StoredBlob {
                bytes,
                metadata,
                token,
            },
        );
        Ok(format!(
            "{}/o/{}?alt=media&token={token}",
            self.base_url.trim_end_matches('/'),
            path.replace('/', "%2F")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn png() -> AvatarFile {
        AvatarFile::new("me.png", "image/png", vec![0x89, b'P', b'N', b'G'])
    }

    #[test]
    fn test_select_single_file() {
        let config = AvatarConfig::default();
        assert!(matches!(select_file(vec![], &config), Err(AvatarError::NoSelection)));
        assert!(matches!(
            select_file(vec![png(), png()], &config),
            Err(AvatarError::MultipleFiles(2))
        ));
        assert_eq!(select_file(vec![png()], &config).unwrap().name, "me.png");
    }

    #[test]
    fn test_rejects_wrong_type() {
        let config = AvatarConfig::default();
        let gif = AvatarFile::new("a.gif", "image/gif", vec![1]);
        let err = select_file(vec![gif], &config).unwrap_err();
        assert_eq!(err.to_string(), "Wrong file type image/gif");

        let jpg = AvatarFile::new("a.jpg", "image/jpg", vec![1]);
        assert!(select_file(vec![jpg], &config).is_ok());

        let empty = AvatarFile::new("a.png", "image/png", vec![]);
        assert!(matches!(select_file(vec![empty], &config), Err(AvatarError::EmptyFile)));
    }

    #[tokio::test]
    async fn test_user_updates_fan_out() {
        let store = MemoryStore::new();
        store.connect();
        store.seed(
            &StorePath::new("/messages"),
            json!({
                "m1": {"text": "hi", "author": {"uid": "u1", "name": "Ada"}},
                "m2": {"text": "yo", "author": {"uid": "u2", "name": "Bob"}},
                "m3": {"text": "ok", "author": {"uid": "u1", "name": "Ada"}}
            }),
        );
        store.seed(
            &StorePath::new("/rooms"),
            json!({
                "r1": {"name": "general", "lastMessage": {"author": {"uid": "u1"}}},
                "r2": {"name": "random", "lastMessage": {"author": {"uid": "u2"}}},
                "r3": {"name": "empty"}
            }),
        );

        let updates = user_updates(&store, &PathLayout::default(), "u1", "avatar", json!("url"))
            .await
            .unwrap();
        let paths: Vec<&str> = updates.keys().map(StorePath::as_str).collect();
        assert_eq!(
            paths,
            vec![
                "/messages/m1/author/avatar",
                "/messages/m3/author/avatar",
                "/profiles/u1/avatar",
                "/rooms/r1/lastMessage/author/avatar",
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_blob_store_url() {
        let blobs = MemoryBlobStore::new("https://blobs.test/v0/");
        let url = blobs
            .upload(
                "profile/u1/avatar",
                vec![1, 2],
                UploadMetadata {
                    content_type: "image/png".into(),
                    cache_control: "public, max-age=259200".into(),
                },
            )
            .await
            .unwrap();
        assert!(url.starts_with("https://blobs.test/v0/o/profile%2Fu1%2Favatar?alt=media&token="));
        assert_eq!(blobs.get("profile/u1/avatar").await.unwrap().bytes, vec![1, 2]);

        blobs.set_unavailable(true);
        let err = blobs
            .upload("x", vec![1], UploadMetadata {
                content_type: "image/png".into(),
                cache_control: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Unavailable(_)));
    }
}
