//! Configuration for the sync engine.

use docsync_protocol::Namespace;
use std::time::Duration;

/// Prefix of the local collections holding user data.
const USER_PREFIX: &str = "sync_user_";
/// Prefix of the local collections holding undo records.
const UNDO_PREFIX: &str = "sync_undo_";
/// Prefix of the local collections holding sync configuration.
const CONFIG_PREFIX: &str = "sync_config_";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Scopes the persisted configuration; engines with different keys
    /// never see each other's state.
    pub instance_key: String,
    /// Sleep after a pass that ran.
    pub short_sleep: Duration,
    /// Sleep after a pass that was skipped or failed.
    pub long_sleep: Duration,
    /// Whether `start` spawns the background loop. Hosts that drive
    /// `do_sync_pass` themselves turn this off.
    pub run_background_loop: bool,
}

impl SyncConfig {
    /// Creates a configuration for the given instance key.
    pub fn new(instance_key: impl Into<String>) -> Self {
        Self {
            instance_key: instance_key.into(),
            short_sleep: Duration::from_secs(1),
            long_sleep: Duration::from_secs(5),
            run_background_loop: true,
        }
    }

    /// Sets the sleep after a successful pass.
    pub fn with_short_sleep(mut self, sleep: Duration) -> Self {
        self.short_sleep = sleep;
        self
    }

    /// Sets the sleep after a skipped or failed pass.
    pub fn with_long_sleep(mut self, sleep: Duration) -> Self {
        self.long_sleep = sleep;
        self
    }

    /// Enables or disables the background loop.
    pub fn with_background_loop(mut self, enabled: bool) -> Self {
        self.run_background_loop = enabled;
        self
    }

    /// Local collection holding the user documents of `namespace`.
    pub fn user_collection(namespace: &Namespace) -> String {
        format!("{USER_PREFIX}{}.{}", namespace.database, namespace.collection)
    }

    /// Local collection holding undo records for `namespace`.
    pub fn undo_collection(namespace: &Namespace) -> String {
        format!("{UNDO_PREFIX}{}.{}", namespace.database, namespace.collection)
    }

    /// Local collection holding namespace records.
    pub fn namespaces_collection(&self) -> String {
        format!("{}.namespaces", self.config_database())
    }

    /// Local collection holding document records.
    pub fn documents_collection(&self) -> String {
        format!("{}.documents", self.config_database())
    }

    fn config_database(&self) -> String {
        format!("{CONFIG_PREFIX}{}", self.instance_key.replace('/', "_"))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("app/user-1")
            .with_short_sleep(Duration::from_millis(10))
            .with_long_sleep(Duration::from_millis(50))
            .with_background_loop(false);

        assert_eq!(config.instance_key, "app/user-1");
        assert_eq!(config.short_sleep, Duration::from_millis(10));
        assert_eq!(config.long_sleep, Duration::from_millis(50));
        assert!(!config.run_background_loop);
    }

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.instance_key, "default");
        assert_eq!(config.short_sleep, Duration::from_secs(1));
        assert_eq!(config.long_sleep, Duration::from_secs(5));
        assert!(config.run_background_loop);
    }

    #[test]
    fn collection_names() {
        let ns = Namespace::new("app", "todos");
        assert_eq!(SyncConfig::user_collection(&ns), "sync_user_app.todos");
        assert_eq!(SyncConfig::undo_collection(&ns), "sync_undo_app.todos");

        let config = SyncConfig::new("app/user-1");
        assert_eq!(config.namespaces_collection(), "sync_config_app_user-1.namespaces");
        assert_eq!(config.documents_collection(), "sync_config_app_user-1.documents");
    }
}
