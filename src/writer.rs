use async_trait::async_trait;

use crate::error::WriteError;

/// Named payload storage the reconciler publishes into.
///
/// `read` returns an empty string when nothing has been written under `key`
/// yet, so a first run never fails on a missing object.
#[async_trait]
pub trait OutputWriter: Send + Sync {
    /// Short human-readable destination, used in log lines.
    fn describe(&self) -> String;

    async fn write(&self, key: &str, payload: &str) -> Result<(), WriteError>;

    async fn read(&self, key: &str) -> Result<String, WriteError>;
}
