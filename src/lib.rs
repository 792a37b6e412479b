//! Waystation - a project-management substrate for AI coding agents.
//!
//! This library provides durable task and epic tracking, agent "mission"
//! sessions, persona identities, work handoffs, and review gates, all backed
//! by a single SQLite database. The center of the crate is the task/epic
//! lifecycle engine: every mutating operation commits transactionally and
//! recomputes derived epic status before any caller can observe the change.
//!
//! Presentation layers (CLI, markdown rendering, codename generation) live
//! outside this crate and consume the lifecycle operations on
//! [`storage::Storage`].

pub mod config;
pub mod ids;
pub mod models;
pub mod storage;

/// Test utilities for isolated test environments.
#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::Path;

    use tempfile::TempDir;

    use crate::storage::Storage;

    /// Test environment with isolated storage using dependency injection.
    ///
    /// Storage tests use `TestEnv::new()` + `init_storage()` so each test gets
    /// its own database file and never touches the user's data directory.
    pub struct TestEnv {
        /// Simulated project directory
        pub project_dir: TempDir,
        /// Isolated data storage directory
        pub data_dir: TempDir,
    }

    impl TestEnv {
        /// Create a new test environment with isolated directories.
        pub fn new() -> Self {
            Self {
                project_dir: TempDir::new().unwrap(),
                data_dir: TempDir::new().unwrap(),
            }
        }

        /// Get the path to the simulated project.
        pub fn path(&self) -> &Path {
            self.project_dir.path()
        }

        /// Get the path to the isolated data directory.
        pub fn data_path(&self) -> &Path {
            self.data_dir.path()
        }

        /// Initialize storage for this test environment.
        pub fn init_storage(&self) -> Storage {
            Storage::init_with_data_dir(self.path(), self.data_path()).unwrap()
        }

        /// Open previously initialized storage for this test environment.
        pub fn open_storage(&self) -> Storage {
            Storage::open_with_data_dir(self.path(), self.data_path()).unwrap()
        }
    }

    impl Default for TestEnv {
        fn default() -> Self {
            Self::new()
        }
    }
}

/// Library-level error type for Waystation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not initialized: no waystation database for this project")]
    NotInitialized,

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Task {task_id} is already claimed by mission {mission_id}")]
    AlreadyClaimed { task_id: String, mission_id: i64 },

    #[error("Task {task_id} is blocked on pending review {review_id}")]
    ReviewBlocked { task_id: String, review_id: i64 },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Waystation operations.
pub type Result<T> = std::result::Result<T, Error>;
