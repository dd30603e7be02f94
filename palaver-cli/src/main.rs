//! Palaver presence demo.
//!
//! Runs a scripted session against the in-memory store: sign in, lose the
//! connection, reconnect, upload an avatar, sign out. Prints the resulting
//! store tree and the final snapshot.
//!
//! Usage: `palaver-cli [config.json]`. Set `RUST_LOG=debug` for the full
//! transition log.

use log::info;
use palaver_presence::{
    AvatarFile, AvatarUploader, MemoryBlobStore, MemoryIdentity, MemoryStore, PresenceConfig,
    PresenceEngine, PresenceHandle, PresenceState, SessionIdentity, StorePath,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

type DemoResult<T> = Result<T, Box<dyn std::error::Error>>;

async fn reach(handle: &PresenceHandle, state: PresenceState) -> DemoResult<()> {
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_state(state)).await??;
    info!("demo: reached {state:?}");
    Ok(())
}

#[tokio::main]
async fn main() -> DemoResult<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => PresenceConfig::from_json_file(path)?,
        None => PresenceConfig::default(),
    };

    let store = Arc::new(MemoryStore::with_sentinel(config.paths.connected()));
    let identity = Arc::new(MemoryIdentity::new());
    let blobs = Arc::new(MemoryBlobStore::new("https://blobs.palaver.local/v0"));

    let ada = SessionIdentity::new("ada", "ada@palaver.local");
    store.seed(
        &config.paths.profile(&ada.id)?,
        json!({"name": "Ada", "createdAt": 1_700_000_000_000u64}),
    );
    store.seed(
        &config.paths.messages(),
        json!({"m1": {"text": "hello", "author": {"uid": "ada", "name": "Ada"}}}),
    );

    let handle = PresenceEngine::spawn(store.clone(), identity.clone(), config.clone());

    identity.sign_in(ada.clone());
    store.connect();
    reach(&handle, PresenceState::Online).await?;

    store.drop_connection();
    reach(&handle, PresenceState::AwaitingConnectivity).await?;
    info!(
        "demo: status after drop = {}",
        store.value(&config.paths.status(&ada.id)?).unwrap_or_default()
    );

    store.connect();
    reach(&handle, PresenceState::Online).await?;

    let uploader = AvatarUploader::new(store.clone(), blobs, config.clone());
    let url = uploader
        .upload(&ada.id, AvatarFile::new("ada.png", "image/png", vec![0x89, b'P', b'N', b'G']))
        .await?;
    info!("demo: avatar at {url}");

    let before_sign_out = handle.snapshot();
    handle.sign_out().await?;
    reach(&handle, PresenceState::LoggedOut).await?;

    println!("── snapshot before sign-out ──");
    println!("{}", serde_json::to_string_pretty(&before_sign_out)?);
    println!("── store ──");
    let tree = store.value(&StorePath::root()).unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&tree)?);

    handle.shutdown().await;
    Ok(())
}
