use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `ZHC_TASK_DB` environment variable, falling back to
/// `storage/tasks/task_registry.db` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl DbConfig {
    /// The default database path used when no environment variable is set.
    pub const DEFAULT_PATH: &'static str = "storage/tasks/task_registry.db";

    /// Build a config from the environment.
    ///
    /// Priority: `ZHC_TASK_DB` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let db_path = env::var("ZHC_TASK_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self { db_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// The sqlx connection URL for this database.
    ///
    /// `mode=rwc` creates the file on first connect, matching the registry's
    /// init-on-first-use behavior.
    pub fn connect_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path() {
        let cfg = DbConfig::new("/tmp/reg.db");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/reg.db"));
        assert_eq!(cfg.connect_url(), "sqlite:///tmp/reg.db?mode=rwc");
    }

    #[test]
    fn default_path() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_PATH);
        assert!(cfg.connect_url().ends_with("task_registry.db?mode=rwc"));
    }
}
