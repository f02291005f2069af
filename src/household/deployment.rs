//! One-time "new deployment" announcement.
//!
//! The platform restarts the process freely, so the last announced build id
//! is kept in the store and an announcement only goes out when it changes.

use std::time::Duration;

use tracing::{info, warn};

use crate::household::composer::{ComposedMessage, Composer};
use crate::household::store::KeyValueStore;
use crate::household::transport::{Transport, deliver};

pub const LAST_SHA_KEY: &str = "last_sha";

/// Identity of the running build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub id: String,
    pub description: Option<String>,
}

/// Result of the startup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentCheck {
    pub should_announce: bool,
    pub message: Option<ComposedMessage>,
}

impl DeploymentCheck {
    fn skip() -> Self {
        Self { should_announce: false, message: None }
    }
}

pub struct DeploymentGuard<'a> {
    store: &'a dyn KeyValueStore,
    composer: &'a Composer,
}

impl<'a> DeploymentGuard<'a> {
    pub fn new(store: &'a dyn KeyValueStore, composer: &'a Composer) -> Self {
        Self { store, composer }
    }

    /// Decide whether `build` needs announcing.
    ///
    /// An unreadable store means no announcement. An empty store is seeded
    /// with the current id so the next change is announced; otherwise
    /// nothing is written here.
    pub fn check(&self, build: &BuildInfo) -> DeploymentCheck {
        let last = match self.store.get(LAST_SHA_KEY) {
            Ok(last) => last,
            Err(e) => {
                warn!("Could not read last deployment, skipping announcement: {}", e);
                return DeploymentCheck::skip();
            }
        };
        info!("Current SHA: {}", build.id);
        info!("Last SHA: {:?}", last);

        let Some(last) = last else {
            info!("No deployment recorded yet, not announcing");
            self.record(build);
            return DeploymentCheck::skip();
        };
        if last == build.id {
            return DeploymentCheck::skip();
        }

        DeploymentCheck {
            should_announce: true,
            message: Some(self.composer.reply(&announcement_body(build))),
        }
    }

    /// Remember `build` as announced.
    pub fn record(&self, build: &BuildInfo) {
        if let Err(e) = self.store.set(LAST_SHA_KEY, &build.id) {
            warn!("Failed to record deployment {}: {}", build.id, e);
        }
    }

    /// Check, send the announcement to `chat_id` if needed, then record the build.
    ///
    /// The record is written after the send was attempted, whatever its outcome.
    pub async fn check_and_announce<T: Transport>(
        &self,
        build: &BuildInfo,
        transport: &T,
        chat_id: i64,
        timeout: Duration,
    ) -> DeploymentCheck {
        let check = self.check(build);
        if let Some(ref message) = check.message {
            info!("Announcing new deployment {}", build.id);
            let _ = deliver(transport, chat_id, &message.text(), timeout).await;
            self.record(build);
        }
        check
    }
}

fn announcement_body(build: &BuildInfo) -> String {
    let mut body = format!("New Deployment\nSHA: {}", build.id);
    if let Some(ref description) = build.description {
        body.push_str(&format!("\nMessage: {}", description));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::household::store::{SqliteStore, StoreError};
    use crate::household::transport::testing::RecordingTransport;

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    fn build(id: &str) -> BuildInfo {
        BuildInfo { id: id.to_string(), description: Some("Fix trash day".to_string()) }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_same_build_is_silent() {
        let store = SqliteStore::in_memory().unwrap();
        store.set(LAST_SHA_KEY, "A").unwrap();
        let composer = Composer::default();
        let transport = RecordingTransport::default();

        let check = DeploymentGuard::new(&store, &composer)
            .check_and_announce(&build("A"), &transport, 1, TIMEOUT)
            .await;

        assert!(!check.should_announce);
        assert!(check.message.is_none());
        assert!(transport.sent().is_empty());
        assert_eq!(store.get(LAST_SHA_KEY).unwrap().as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_new_build_announces_once() {
        let store = SqliteStore::in_memory().unwrap();
        store.set(LAST_SHA_KEY, "A").unwrap();
        let composer = Composer::default();
        let transport = RecordingTransport::default();
        let guard = DeploymentGuard::new(&store, &composer);

        let check = guard.check_and_announce(&build("B"), &transport, 1, TIMEOUT).await;
        assert!(check.should_announce);
        let text = check.message.unwrap().text();
        assert!(text.contains("SHA: B"));
        assert!(text.contains("Message: Fix trash day"));
        assert_eq!(store.get(LAST_SHA_KEY).unwrap().as_deref(), Some("B"));

        // Restart with the same build
        let check = guard.check_and_announce(&build("B"), &transport, 1, TIMEOUT).await;
        assert!(!check.should_announce);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].0, 1);
    }

    #[tokio::test]
    async fn test_failed_send_still_records() {
        let store = SqliteStore::in_memory().unwrap();
        store.set(LAST_SHA_KEY, "A").unwrap();
        let composer = Composer::default();
        let transport = RecordingTransport::failing();

        let check = DeploymentGuard::new(&store, &composer)
            .check_and_announce(&build("B"), &transport, 1, TIMEOUT)
            .await;
        assert!(check.should_announce);
        assert_eq!(store.get(LAST_SHA_KEY).unwrap().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_unreadable_store_skips() {
        let composer = Composer::default();
        let transport = RecordingTransport::default();

        let check = DeploymentGuard::new(&BrokenStore, &composer)
            .check_and_announce(&build("B"), &transport, 1, TIMEOUT)
            .await;
        assert!(!check.should_announce);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_empty_store_is_seeded_without_announcing() {
        let store = SqliteStore::in_memory().unwrap();
        let composer = Composer::default();
        let guard = DeploymentGuard::new(&store, &composer);

        assert!(!guard.check(&build("A")).should_announce);
        assert_eq!(store.get(LAST_SHA_KEY).unwrap().as_deref(), Some("A"));
        assert!(guard.check(&build("B")).should_announce);
    }

    #[test]
    fn test_check_does_not_write_on_change() {
        let store = SqliteStore::in_memory().unwrap();
        store.set(LAST_SHA_KEY, "A").unwrap();
        let composer = Composer::default();
        let check = DeploymentGuard::new(&store, &composer).check(&build("B"));
        assert!(check.should_announce);
        assert_eq!(store.get(LAST_SHA_KEY).unwrap().as_deref(), Some("A"));
    }

    #[test]
    fn test_announcement_without_description() {
        let body = announcement_body(&BuildInfo { id: "abc".into(), description: None });
        assert_eq!(body, "New Deployment\nSHA: abc");
    }
}
