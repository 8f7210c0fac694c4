//! Format Version Migration
//!
//! Decides, once per disk tier instance, whether persisted entries written
//! under an older format version are reused, migrated in place, or
//! discarded.
//!
//! # Decision Order
//!
//! 1. No stamp: fresh location, stamp the current version, `Reuse`
//! 2. Stamp equals current: `Reuse`, no hooks
//! 3. `should_use_disk_version(stored)` is true: `Reuse`, stamp untouched
//! 4. `migrate_from_disk_version(stored)` succeeds: re-stamp, `Migrate`
//! 5. Anything else: wipe all entries, re-stamp, `Discard`
//!
//! The location is never left mixed: if the wipe itself fails the caller
//! gets an error and must treat the tier as unavailable.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{info, instrument, warn};

use super::hooks::MigrationHooks;
use super::storage::StorageBackend;
use crate::error::{Error, Result};

/// Opaque on-disk format version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatVersion(String);

impl FormatVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FormatVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FormatVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What happened to the persisted entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "from", rename_all = "snake_case")]
pub enum MigrationDecision {
    /// Entries kept as they are
    Reuse,
    /// Entries converted in place from the given version
    Migrate(FormatVersion),
    /// All entries erased
    Discard,
}

impl fmt::Display for MigrationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDecision::Reuse => f.write_str("reuse"),
            MigrationDecision::Migrate(from) => write!(f, "migrate from {}", from),
            MigrationDecision::Discard => f.write_str("discard"),
        }
    }
}

/// Result of the initialization pass
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub decision: MigrationDecision,
    /// Stamp found at startup (`None` for a fresh or unreadable location)
    pub stored_version: Option<FormatVersion>,
    /// Stamp left on disk after the pass
    pub stamped_version: FormatVersion,
    /// True when the location had never been stamped
    pub fresh: bool,
    /// Why entries were discarded, when a failure forced it
    pub failure: Option<String>,
}

/// Runs the version comparison and hooks against a backend
pub struct MigrationCoordinator {
    backend: Arc<dyn StorageBackend>,
    current: FormatVersion,
    hooks: MigrationHooks,
}

impl MigrationCoordinator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        current: FormatVersion,
        hooks: MigrationHooks,
    ) -> Self {
        Self {
            backend,
            current,
            hooks,
        }
    }

    /// Run the decision procedure.
    ///
    /// An `Err` means the location could not be brought to a consistent
    /// state and must not be served.
    #[instrument(skip(self), fields(current = %self.current))]
    pub async fn run(&self) -> Result<MigrationOutcome> {
        let stored = match self.backend.read_version_stamp().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Unreadable version stamp, discarding disk entries");
                return self
                    .discard(None, format!("unreadable version stamp: {}", e))
                    .await;
            }
        };

        let Some(stored) = stored else {
            self.backend.write_version_stamp(&self.current).await?;
            info!(version = %self.current, "Stamped fresh disk location");
            return Ok(self.outcome(MigrationDecision::Reuse, None, self.current.clone(), true));
        };

        if stored == self.current {
            info!(version = %stored, "Disk format version matches, reusing entries");
            return Ok(self.outcome(MigrationDecision::Reuse, Some(stored.clone()), stored, false));
        }

        if let Some(should_use) = self.hooks.should_use_disk_version.clone() {
            let version = stored.clone();
            match run_hook(move || should_use(&version)).await {
                Ok(true) => {
                    info!(
                        stored = %stored,
                        current = %self.current,
                        "Reusing entries from older disk format version"
                    );
                    return Ok(self.outcome(
                        MigrationDecision::Reuse,
                        Some(stored.clone()),
                        stored,
                        false,
                    ));
                }
                Ok(false) => {}
                Err(reason) => {
                    warn!(stored = %stored, %reason, "should_use_disk_version hook panicked");
                }
            }
        }

        let Some(migrate) = self.hooks.migrate_from_disk_version.clone() else {
            return self
                .discard(Some(stored), "no migration available".to_string())
                .await;
        };

        let version = stored.clone();
        let failure = match run_hook(move || migrate(&version)).await {
            Ok(Ok(())) => match self.backend.write_version_stamp(&self.current).await {
                Ok(()) => {
                    info!(from = %stored, to = %self.current, "Migrated disk entries");
                    return Ok(self.outcome(
                        MigrationDecision::Migrate(stored.clone()),
                        Some(stored),
                        self.current.clone(),
                        false,
                    ));
                }
                Err(e) => format!("stamp after migration failed: {}", e),
            },
            Ok(Err(e)) => e.to_string(),
            Err(reason) => reason,
        };

        let err = Error::MigrationFailure {
            from_version: stored.to_string(),
            reason: failure,
        };
        warn!(error = %err, "Migration failed, discarding disk entries");
        self.discard(Some(stored), err.to_string()).await
    }

    async fn discard(
        &self,
        stored: Option<FormatVersion>,
        failure: String,
    ) -> Result<MigrationOutcome> {
        wipe_and_stamp(self.backend.as_ref(), &self.current).await?;
        info!(
            stored = ?stored.as_ref().map(FormatVersion::as_str),
            current = %self.current,
            %failure,
            "Discarded disk entries"
        );
        let mut outcome = self.outcome(
            MigrationDecision::Discard,
            stored,
            self.current.clone(),
            false,
        );
        outcome.failure = Some(failure);
        Ok(outcome)
    }

    fn outcome(
        &self,
        decision: MigrationDecision,
        stored_version: Option<FormatVersion>,
        stamped_version: FormatVersion,
        fresh: bool,
    ) -> MigrationOutcome {
        MigrationOutcome {
            decision,
            stored_version,
            stamped_version,
            fresh,
            failure: None,
        }
    }
}

/// Erase every entry and stamp `current`; shared by Discard and full clears
pub(crate) async fn wipe_and_stamp(
    backend: &dyn StorageBackend,
    current: &FormatVersion,
) -> Result<()> {
    backend.wipe_all().await?;
    backend.write_version_stamp(current).await
}

/// Run a hook on the blocking pool, turning a panic into an error message
async fn run_hook<T, F>(hook: F) -> std::result::Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(hook)
        .await
        .map_err(describe_join_error)
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "hook task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("hook panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("hook panicked: {}", msg)
    } else {
        "hook panicked".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
