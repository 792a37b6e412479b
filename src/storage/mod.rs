//! Storage layer and lifecycle engine for Waystation data.
//!
//! One SQLite database per project holds every entity: personas, missions,
//! epics, tasks, task dependencies, reviews, handoffs, and task templates.
//! The database is the single source of truth; there is no secondary log.
//!
//! Every mutating lifecycle operation runs inside one transaction that also
//! recomputes derived state (epic status) before committing, so no reader
//! ever observes a task whose epic status is stale. Claims use IMMEDIATE
//! transactions: of two concurrent claims on the same task, exactly one
//! wins and the other fails with `AlreadyClaimed`.

use crate::config::{RejectionPolicy, WorkflowConfig};
use crate::ids;
use crate::models::{
    Category, Epic, EpicStatus, Handoff, HandoffStatus, Mission, Persona, Priority, Review,
    ReviewStatus, ReviewType, Role, Task, TaskStatus, TaskTemplate,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database file name inside the per-project data directory.
const DB_FILE: &str = "project.db";

/// Fields for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub role: Role,
    pub priority: Priority,
    pub category: Option<Category>,
    pub description: Option<String>,
    pub epic_id: Option<String>,
}

impl NewTask {
    /// Convenience constructor for the common title/role/priority case.
    pub fn new(title: impl Into<String>, role: Role, priority: Priority) -> Self {
        Self {
            title: title.into(),
            role,
            priority,
            category: None,
            description: None,
            epic_id: None,
        }
    }

    pub fn with_epic(mut self, epic_id: impl Into<String>) -> Self {
        self.epic_id = Some(epic_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

/// Partial update for a task. `notes` appends; `actual_hours` overwrites.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub notes: Option<String>,
    pub actual_hours: Option<f64>,
}

/// Filters for listing tasks. All fields are AND-combined.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub role: Option<Role>,
    pub priority: Option<Priority>,
    pub category: Option<Category>,
    pub epic_id: Option<String>,
    pub mission_id: Option<i64>,
}

/// Updatable epic fields. Status is never settable here; it is derived.
#[derive(Debug, Clone, Default)]
pub struct EpicUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

/// Fields for creating a review.
#[derive(Debug, Clone)]
pub struct NewReview {
    pub review_type: ReviewType,
    pub title: String,
    pub description: Option<String>,
    pub task_id: Option<String>,
    pub requested_by: Option<String>,
    pub artifact_path: Option<String>,
}

impl NewReview {
    pub fn new(review_type: ReviewType, title: impl Into<String>) -> Self {
        Self {
            review_type,
            title: title.into(),
            description: None,
            task_id: None,
            requested_by: None,
            artifact_path: None,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Fields for creating a handoff.
#[derive(Debug, Clone)]
pub struct NewHandoff {
    pub task_id: String,
    pub from_mission_id: i64,
    pub to_role: Role,
    pub summary: String,
    pub files: Vec<String>,
    pub acceptance_criteria: Option<String>,
    pub notes: Option<String>,
}

/// Fields for creating a task template.
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub name: String,
    pub role: Role,
    pub priority: Priority,
    pub category: Option<Category>,
    pub description: Option<String>,
}

/// Storage manager for a single project.
pub struct Storage {
    /// Root directory for this project's data
    pub root: PathBuf,
    /// SQLite connection; the single source of truth
    conn: Connection,
    /// Workflow policy knobs loaded from `config.toml`
    config: WorkflowConfig,
}

impl Storage {
    /// Open or create storage for the given project path.
    pub fn open(project_path: &Path) -> Result<Self> {
        let root = get_storage_dir(project_path)?;
        if !root.exists() {
            return Err(Error::NotInitialized);
        }
        Self::open_at(root)
    }

    /// Initialize storage for a new project.
    pub fn init(project_path: &Path) -> Result<Self> {
        let root = get_storage_dir(project_path)?;
        fs::create_dir_all(&root)?;
        Self::open_at(root)
    }

    /// Check if storage exists for the given project path.
    pub fn exists(project_path: &Path) -> Result<bool> {
        let root = get_storage_dir(project_path)?;
        Ok(root.join(DB_FILE).exists())
    }

    /// Open storage rooted under an explicit base data directory.
    ///
    /// Dependency-injection variant of [`Storage::open`] for tests and
    /// embedders that manage their own data location.
    pub fn open_with_data_dir(project_path: &Path, data_dir: &Path) -> Result<Self> {
        let root = data_dir.join(project_hash(project_path)?);
        if !root.exists() {
            return Err(Error::NotInitialized);
        }
        Self::open_at(root)
    }

    /// Initialize storage rooted under an explicit base data directory.
    pub fn init_with_data_dir(project_path: &Path, data_dir: &Path) -> Result<Self> {
        let root = data_dir.join(project_hash(project_path)?);
        fs::create_dir_all(&root)?;
        Self::open_at(root)
    }

    fn open_at(root: PathBuf) -> Result<Self> {
        let conn = Connection::open(root.join(DB_FILE))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns a result row, so pragma_update won't do
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        Self::init_schema(&conn)?;
        let config = WorkflowConfig::load(&root)?;
        Ok(Self { root, conn, config })
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS personas (
                name TEXT PRIMARY KEY,
                role TEXT NOT NULL CHECK (role IN (
                    'Manager','Architect','Engineer','Tester','Documentarian',
                    'Designer','Inspector','Operator','Historian')),
                mythology TEXT NOT NULL,
                description TEXT,
                mission_count INTEGER NOT NULL DEFAULT 0,
                last_mission_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS missions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                persona_name TEXT NOT NULL REFERENCES personas(name),
                role TEXT NOT NULL CHECK (role IN (
                    'Manager','Architect','Engineer','Tester','Documentarian',
                    'Designer','Inspector','Operator','Historian')),
                codename TEXT NOT NULL,
                objective TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS epics (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'TODO' CHECK (status IN (
                    'TODO','UNDERWAY','COMPLETE','ABORTED')),
                priority TEXT NOT NULL CHECK (priority IN (
                    'CRITICAL','HIGH','MEDIUM','LOW')),
                aborted_reason TEXT,
                completed_at TEXT,
                aborted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'TODO' CHECK (status IN (
                    'TODO','UNDERWAY','BLOCKED','PAUSED','REVIEW','COMPLETE','ABORTED')),
                priority TEXT NOT NULL CHECK (priority IN (
                    'CRITICAL','HIGH','MEDIUM','LOW')),
                role TEXT NOT NULL CHECK (role IN (
                    'Manager','Architect','Engineer','Tester','Documentarian',
                    'Designer','Inspector','Operator','Historian')),
                category TEXT CHECK (category IS NULL OR category IN (
                    'feature','bug-fix','refactor','documentation','testing',
                    'infrastructure','security','performance','architecture','maintenance')),
                epic_id TEXT REFERENCES epics(id),
                current_mission_id INTEGER REFERENCES missions(id),
                blocks_on_review_id INTEGER REFERENCES reviews(id),
                description TEXT,
                notes TEXT,
                actual_hours REAL,
                claimed_at TEXT,
                closed_at TEXT,
                paused_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_dependencies (
                task_id TEXT NOT NULL REFERENCES tasks(id),
                depends_on_task_id TEXT NOT NULL REFERENCES tasks(id),
                created_at TEXT NOT NULL,
                PRIMARY KEY (task_id, depends_on_task_id)
            );

            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                review_type TEXT NOT NULL CHECK (review_type IN (
                    'code','task_completion','design','general')),
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN (
                    'pending','approved','rejected')),
                task_id TEXT REFERENCES tasks(id),
                title TEXT NOT NULL,
                description TEXT,
                requested_by TEXT,
                requested_at TEXT NOT NULL,
                reviewed_by TEXT,
                reviewed_at TEXT,
                outcome_reason TEXT,
                artifact_path TEXT
            );

            CREATE TABLE IF NOT EXISTS handoffs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                from_mission_id INTEGER NOT NULL REFERENCES missions(id),
                to_role TEXT NOT NULL CHECK (to_role IN (
                    'Manager','Architect','Engineer','Tester','Documentarian',
                    'Designer','Inspector','Operator','Historian')),
                to_mission_id INTEGER REFERENCES missions(id),
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN (
                    'pending','accepted','completed','cancelled')),
                summary TEXT NOT NULL,
                files TEXT,
                acceptance_criteria TEXT,
                notes TEXT,
                created_at TEXT NOT NULL,
                accepted_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS task_templates (
                name TEXT PRIMARY KEY,
                role TEXT NOT NULL CHECK (role IN (
                    'Manager','Architect','Engineer','Tester','Documentarian',
                    'Designer','Inspector','Operator','Historian')),
                priority TEXT NOT NULL CHECK (priority IN (
                    'CRITICAL','HIGH','MEDIUM','LOW')),
                category TEXT,
                description TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counters (
                prefix TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_epic ON tasks(epic_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_role ON tasks(role);
            CREATE INDEX IF NOT EXISTS idx_tasks_mission ON tasks(current_mission_id);
            CREATE INDEX IF NOT EXISTS idx_missions_end_time ON missions(end_time);
            CREATE INDEX IF NOT EXISTS idx_reviews_status ON reviews(status);
            CREATE INDEX IF NOT EXISTS idx_handoffs_status ON handoffs(status);
            CREATE INDEX IF NOT EXISTS idx_handoffs_to_role ON handoffs(to_role);
            "#,
        )?;
        Ok(())
    }

    /// Current workflow configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Replace the workflow configuration and persist it.
    pub fn set_config(&mut self, config: WorkflowConfig) -> Result<()> {
        config.save(&self.root)?;
        self.config = config;
        Ok(())
    }

    // === Persona Operations ===

    /// Add a new persona. Persona names are unique and personas are never
    /// deleted; they anchor referential integrity for missions.
    pub fn add_persona(
        &mut self,
        name: &str,
        role: Role,
        mythology: &str,
        description: Option<&str>,
    ) -> Result<Persona> {
        let now = now_str();
        self.conn
            .execute(
                r#"
                INSERT INTO personas (name, role, mythology, description, mission_count, created_at)
                VALUES (?1, ?2, ?3, ?4, 0, ?5)
                "#,
                params![name, role.as_str(), mythology, description, now],
            )
            .map_err(db_write_err)?;
        tracing::info!(persona = name, role = role.as_str(), "persona added");
        self.get_persona(name)
    }

    /// Get a persona by name.
    pub fn get_persona(&self, name: &str) -> Result<Persona> {
        self.conn
            .query_row(
                "SELECT name, role, mythology, description, mission_count, last_mission_at, created_at
                 FROM personas WHERE name = ?1",
                [name],
                persona_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("persona not found: {}", name)))
    }

    /// List personas, optionally filtered by role, least-used first.
    pub fn list_personas(&self, role: Option<Role>) -> Result<Vec<Persona>> {
        let mut sql = String::from(
            "SELECT name, role, mythology, description, mission_count, last_mission_at, created_at
             FROM personas WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(r) = role {
            sql.push_str(" AND role = ?");
            params_vec.push(Box::new(r.as_str().to_string()));
        }
        sql.push_str(" ORDER BY mission_count ASC, name ASC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let personas = stmt
            .query_map(params_refs.as_slice(), persona_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(personas)
    }

    /// Update a persona's free-text bio. Everything else is immutable.
    pub fn update_persona_bio(&mut self, name: &str, description: &str) -> Result<Persona> {
        let changed = self.conn.execute(
            "UPDATE personas SET description = ?1 WHERE name = ?2",
            params![description, name],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("persona not found: {}", name)));
        }
        self.get_persona(name)
    }

    // === Mission Operations ===

    /// Start a mission for a persona. The codename is supplied by the caller
    /// (the generator lives outside the core) and treated as opaque.
    pub fn start_mission(
        &mut self,
        persona_name: &str,
        role: Role,
        codename: &str,
        objective: &str,
    ) -> Result<Mission> {
        let tx = self.tx()?;
        // Persona must exist; missions are its usage record
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM personas WHERE name = ?1",
                [persona_name],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(Error::NotFound(format!(
                "persona not found: {}",
                persona_name
            )));
        }

        let now = now_str();
        tx.execute(
            r#"
            INSERT INTO missions (persona_name, role, codename, objective, start_time, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)
            "#,
            params![persona_name, role.as_str(), codename, objective, now],
        )
        .map_err(db_write_err)?;
        let mission_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE personas SET mission_count = mission_count + 1, last_mission_at = ?1 WHERE name = ?2",
            params![now, persona_name],
        )?;

        let mission = get_mission_tx(&tx, mission_id)?;
        tx.commit()?;
        tracing::info!(
            mission = mission_id,
            persona = persona_name,
            codename,
            "mission started"
        );
        Ok(mission)
    }

    /// End a mission. Ending an already-ended mission is an error.
    pub fn end_mission(&mut self, mission_id: i64) -> Result<Mission> {
        let tx = self.tx()?;
        let mission = get_mission_tx(&tx, mission_id)?;
        if mission.end_time.is_some() {
            return Err(Error::InvalidTransition(format!(
                "mission {} already ended",
                mission_id
            )));
        }
        let now = now_str();
        tx.execute(
            "UPDATE missions SET end_time = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, mission_id],
        )?;
        let mission = get_mission_tx(&tx, mission_id)?;
        tx.commit()?;
        tracing::info!(mission = mission_id, "mission ended");
        Ok(mission)
    }

    /// Get a mission by ID.
    pub fn get_mission(&self, mission_id: i64) -> Result<Mission> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM missions WHERE id = ?1", MISSION_COLS),
                [mission_id],
                mission_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("mission not found: {}", mission_id)))
    }

    /// List missions, newest first.
    pub fn list_missions(&self, active_only: bool, role: Option<Role>) -> Result<Vec<Mission>> {
        let mut sql = format!("SELECT {} FROM missions WHERE 1=1", MISSION_COLS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if active_only {
            sql.push_str(" AND end_time IS NULL");
        }
        if let Some(r) = role {
            sql.push_str(" AND role = ?");
            params_vec.push(Box::new(r.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let missions = stmt
            .query_map(params_refs.as_slice(), mission_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(missions)
    }

    // === Task Operations ===

    /// Create a new task with a generated ID.
    ///
    /// The sequence number comes from the per-prefix counter table, so IDs
    /// are never reused even across aborted tasks and concurrent creators
    /// never collide.
    pub fn create_task(&mut self, spec: NewTask) -> Result<Task> {
        let tx = self.tx()?;
        if let Some(epic_id) = &spec.epic_id {
            ensure_epic_exists(&tx, epic_id)?;
        }

        let seq = next_sequence(&tx, &ids::task_prefix(spec.role, spec.priority))?;
        let id = ids::format_task_id(spec.role, spec.priority, seq)?;
        let now = now_str();
        tx.execute(
            r#"
            INSERT INTO tasks (id, title, status, priority, role, category, epic_id,
                               description, created_at, updated_at)
            VALUES (?1, ?2, 'TODO', ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                id,
                spec.title,
                spec.priority.as_str(),
                spec.role.as_str(),
                spec.category.map(|c| c.as_str()),
                spec.epic_id,
                spec.description,
                now,
            ],
        )
        .map_err(db_write_err)?;

        if let Some(epic_id) = &spec.epic_id {
            recompute_epic_status(&tx, epic_id)?;
        }

        let task = get_task_tx(&tx, &id)?;
        tx.commit()?;
        tracing::info!(task = %task.id, "task created");
        Ok(task)
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLS),
                [task_id],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("task not found: {}", task_id)))
    }

    /// List tasks matching a filter, in canonical order: priority
    /// (CRITICAL first), role prefix, sequence number.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {} FROM tasks WHERE 1=1", TASK_COLS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(s) = filter.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(s.as_str().to_string()));
        }
        if let Some(r) = filter.role {
            sql.push_str(" AND role = ?");
            params_vec.push(Box::new(r.as_str().to_string()));
        }
        if let Some(p) = filter.priority {
            sql.push_str(" AND priority = ?");
            params_vec.push(Box::new(p.as_str().to_string()));
        }
        if let Some(c) = filter.category {
            sql.push_str(" AND category = ?");
            params_vec.push(Box::new(c.as_str().to_string()));
        }
        if let Some(e) = &filter.epic_id {
            sql.push_str(" AND epic_id = ?");
            params_vec.push(Box::new(e.clone()));
        }
        if let Some(m) = filter.mission_id {
            sql.push_str(" AND current_mission_id = ?");
            params_vec.push(Box::new(m));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut tasks = stmt
            .query_map(params_refs.as_slice(), task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        tasks.sort_by_key(|t| ids::task_sort_key(&t.id));
        Ok(tasks)
    }

    /// Claim a task for a mission.
    ///
    /// Fails with `AlreadyClaimed` if a different mission holds the task,
    /// `ReviewBlocked` if a pending review gates it, and `InvalidTransition`
    /// if the task is COMPLETE or ABORTED. Claiming again under the same
    /// mission is a no-op that re-returns the task.
    pub fn claim_task(&mut self, task_id: &str, mission_id: i64) -> Result<Task> {
        let tx = self.tx()?;
        let task = claim_task_tx(&tx, task_id, mission_id)?;
        tx.commit()?;
        tracing::info!(task = task_id, mission = mission_id, "task claimed");
        Ok(task)
    }

    /// Update a task: append notes, overwrite actual hours, and/or change
    /// status (applying the timestamp invariants and epic recomputation).
    pub fn update_task(&mut self, task_id: &str, update: TaskUpdate) -> Result<Task> {
        let tx = self.tx()?;
        let task = get_task_tx(&tx, task_id)?;

        if let Some(notes) = &update.notes {
            append_notes(&tx, task_id, notes)?;
        }
        if let Some(hours) = update.actual_hours {
            tx.execute(
                "UPDATE tasks SET actual_hours = ?1, updated_at = ?2 WHERE id = ?3",
                params![hours, now_str(), task_id],
            )?;
        }
        if let Some(status) = update.status {
            apply_task_status(&tx, &task, status)?;
            if let Some(epic_id) = &task.epic_id {
                recompute_epic_status(&tx, epic_id)?;
            }
        }

        let task = get_task_tx(&tx, task_id)?;
        tx.commit()?;
        Ok(task)
    }

    /// Close a task with one of the closing statuses
    /// (COMPLETE, PAUSED, BLOCKED, ABORTED).
    ///
    /// COMPLETE and ABORTED release the mission's claim; PAUSED and BLOCKED
    /// keep it so the mission can resume.
    pub fn close_task(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        notes: Option<&str>,
    ) -> Result<Task> {
        if !status.is_closable_target() {
            return Err(Error::InvalidTransition(format!(
                "cannot close task with status {}; expected COMPLETE, PAUSED, BLOCKED, or ABORTED",
                status
            )));
        }

        let tx = self.tx()?;
        let task = get_task_tx(&tx, task_id)?;
        apply_task_status(&tx, &task, status)?;
        if let Some(notes) = notes {
            append_notes(&tx, task_id, notes)?;
        }
        if let Some(epic_id) = &task.epic_id {
            recompute_epic_status(&tx, epic_id)?;
        }
        let task = get_task_tx(&tx, task_id)?;
        tx.commit()?;
        tracing::info!(task = task_id, status = %status, "task closed");
        Ok(task)
    }

    /// Link a task to an epic. Both the previous epic (if any) and the new
    /// one are recomputed in the same transaction.
    pub fn link_task(&mut self, task_id: &str, epic_id: &str) -> Result<Task> {
        let tx = self.tx()?;
        let task = get_task_tx(&tx, task_id)?;
        ensure_epic_exists(&tx, epic_id)?;

        tx.execute(
            "UPDATE tasks SET epic_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![epic_id, now_str(), task_id],
        )?;

        if let Some(old_epic) = &task.epic_id {
            if old_epic != epic_id {
                recompute_epic_status(&tx, old_epic)?;
            }
        }
        recompute_epic_status(&tx, epic_id)?;

        let task = get_task_tx(&tx, task_id)?;
        tx.commit()?;
        Ok(task)
    }

    /// Remove a task from its epic. The old epic is recomputed.
    pub fn unlink_task(&mut self, task_id: &str) -> Result<Task> {
        let tx = self.tx()?;
        let task = get_task_tx(&tx, task_id)?;

        tx.execute(
            "UPDATE tasks SET epic_id = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_str(), task_id],
        )?;
        if let Some(old_epic) = &task.epic_id {
            recompute_epic_status(&tx, old_epic)?;
        }

        let task = get_task_tx(&tx, task_id)?;
        tx.commit()?;
        Ok(task)
    }

    // === Epic Operations ===

    /// Create a new epic with a generated ID. Initial status is TODO.
    pub fn create_epic(
        &mut self,
        title: &str,
        priority: Priority,
        description: Option<&str>,
    ) -> Result<Epic> {
        let tx = self.tx()?;
        let seq = next_sequence(&tx, &ids::epic_prefix(priority))?;
        let id = ids::format_epic_id(priority, seq)?;
        let now = now_str();
        tx.execute(
            r#"
            INSERT INTO epics (id, title, description, status, priority, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'TODO', ?4, ?5, ?5)
            "#,
            params![id, title, description, priority.as_str(), now],
        )
        .map_err(db_write_err)?;
        let epic = get_epic_tx(&tx, &id)?;
        tx.commit()?;
        tracing::info!(epic = %epic.id, "epic created");
        Ok(epic)
    }

    /// Get an epic by ID, with subtask progress counts.
    pub fn get_epic(&self, epic_id: &str) -> Result<Epic> {
        let mut epic = self
            .conn
            .query_row(
                &format!("SELECT {} FROM epics WHERE id = ?1", EPIC_COLS),
                [epic_id],
                epic_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("epic not found: {}", epic_id)))?;
        let (total, complete) = epic_progress(&self.conn, epic_id)?;
        epic.subtask_count = total;
        epic.completed_count = complete;
        Ok(epic)
    }

    /// List epics with optional filters, ordered by ID.
    pub fn list_epics(
        &self,
        status: Option<EpicStatus>,
        priority: Option<Priority>,
    ) -> Result<Vec<Epic>> {
        let mut sql = format!("SELECT {} FROM epics WHERE 1=1", EPIC_COLS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(s) = status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(s.as_str().to_string()));
        }
        if let Some(p) = priority {
            sql.push_str(" AND priority = ?");
            params_vec.push(Box::new(p.as_str().to_string()));
        }
        sql.push_str(" ORDER BY id");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut epics = stmt
            .query_map(params_refs.as_slice(), epic_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for epic in &mut epics {
            let (total, complete) = epic_progress(&self.conn, &epic.id)?;
            epic.subtask_count = total;
            epic.completed_count = complete;
        }
        Ok(epics)
    }

    /// List all tasks belonging to an epic, ordered by ID.
    pub fn list_subtasks(&self, epic_id: &str) -> Result<Vec<Task>> {
        self.get_epic(epic_id)?;
        self.list_tasks(&TaskFilter {
            epic_id: Some(epic_id.to_string()),
            ..TaskFilter::default()
        })
    }

    /// Update an epic's title, description, or priority. Status is derived
    /// and cannot be set here.
    pub fn update_epic(&mut self, epic_id: &str, update: EpicUpdate) -> Result<Epic> {
        let tx = self.tx()?;
        get_epic_tx(&tx, epic_id)?;

        if let Some(title) = &update.title {
            tx.execute(
                "UPDATE epics SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now_str(), epic_id],
            )?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE epics SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![description, now_str(), epic_id],
            )?;
        }
        if let Some(priority) = update.priority {
            tx.execute(
                "UPDATE epics SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                params![priority.as_str(), now_str(), epic_id],
            )?;
        }

        let epic = get_epic_tx(&tx, epic_id)?;
        tx.commit()?;
        Ok(epic)
    }

    /// Abort an epic and cascade to every subtask.
    ///
    /// This is the only path that bulk-mutates tasks from an epic operation.
    /// ABORTED is sticky: the epic is permanently excluded from automatic
    /// recomputation afterwards.
    pub fn abort_epic(&mut self, epic_id: &str, reason: &str) -> Result<Epic> {
        let tx = self.tx()?;
        let epic = get_epic_tx(&tx, epic_id)?;
        if epic.status == EpicStatus::Aborted {
            return Err(Error::InvalidTransition(format!(
                "epic {} is already aborted",
                epic_id
            )));
        }

        let now = now_str();
        tx.execute(
            r#"
            UPDATE epics
            SET status = 'ABORTED', aborted_reason = ?1, aborted_at = ?2,
                completed_at = NULL, updated_at = ?2
            WHERE id = ?3
            "#,
            params![reason, now, epic_id],
        )?;

        // claimed_at backfill keeps the status/timestamp invariants intact
        // for subtasks that never left TODO
        let aborted = tx.execute(
            r#"
            UPDATE tasks
            SET status = 'ABORTED',
                claimed_at = COALESCE(claimed_at, ?1),
                closed_at = ?1,
                paused_at = NULL,
                current_mission_id = NULL,
                updated_at = ?1
            WHERE epic_id = ?2
            "#,
            params![now, epic_id],
        )?;

        let epic = get_epic_tx(&tx, epic_id)?;
        tx.commit()?;
        tracing::info!(epic = epic_id, tasks_aborted = aborted, "epic aborted");
        Ok(epic)
    }

    // === Review Operations ===

    /// Create a review. When tied to a task, the task is forced into REVIEW
    /// and gated on this review until a deliberate unblock.
    pub fn create_review(&mut self, spec: NewReview) -> Result<Review> {
        let tx = self.tx()?;
        let task = match &spec.task_id {
            Some(task_id) => Some(get_task_tx(&tx, task_id)?),
            None => None,
        };

        let now = now_str();
        tx.execute(
            r#"
            INSERT INTO reviews (review_type, status, task_id, title, description,
                                 requested_by, requested_at, artifact_path)
            VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                spec.review_type.as_str(),
                spec.task_id,
                spec.title,
                spec.description,
                spec.requested_by,
                now,
                spec.artifact_path,
            ],
        )
        .map_err(db_write_err)?;
        let review_id = tx.last_insert_rowid();

        if let Some(task) = &task {
            tx.execute(
                "UPDATE tasks SET blocks_on_review_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![review_id, now, task.id],
            )?;
            apply_task_status(&tx, task, TaskStatus::Review)?;
            if let Some(epic_id) = &task.epic_id {
                recompute_epic_status(&tx, epic_id)?;
            }
        }

        let review = get_review_tx(&tx, review_id)?;
        tx.commit()?;
        tracing::info!(review = review_id, task = ?spec.task_id, "review created");
        Ok(review)
    }

    /// Get a review by ID.
    pub fn get_review(&self, review_id: i64) -> Result<Review> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM reviews WHERE id = ?1", REVIEW_COLS),
                [review_id],
                review_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("review not found: {}", review_id)))
    }

    /// List reviews with optional filters, newest first.
    pub fn list_reviews(
        &self,
        status: Option<ReviewStatus>,
        review_type: Option<ReviewType>,
    ) -> Result<Vec<Review>> {
        let mut sql = format!("SELECT {} FROM reviews WHERE 1=1", REVIEW_COLS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(s) = status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(s.as_str().to_string()));
        }
        if let Some(t) = review_type {
            sql.push_str(" AND review_type = ?");
            params_vec.push(Box::new(t.as_str().to_string()));
        }
        sql.push_str(" ORDER BY requested_at DESC, id DESC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let reviews = stmt
            .query_map(params_refs.as_slice(), review_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reviews)
    }

    /// Approve a pending review.
    ///
    /// The gated task is deliberately left untouched: claiming starts
    /// succeeding on its own because the gate only fires on pending reviews.
    pub fn approve_review(
        &mut self,
        review_id: i64,
        reviewed_by: &str,
        reason: Option<&str>,
    ) -> Result<Review> {
        let tx = self.tx()?;
        resolve_review(&tx, review_id, ReviewStatus::Approved, reviewed_by, reason)?;
        let review = get_review_tx(&tx, review_id)?;
        tx.commit()?;
        tracing::info!(review = review_id, "review approved");
        Ok(review)
    }

    /// Reject a pending review.
    ///
    /// Under the `release-task` policy the gated task additionally drops
    /// back to TODO with its block pointer cleared; the default policy
    /// leaves it in REVIEW.
    pub fn reject_review(
        &mut self,
        review_id: i64,
        reason: &str,
        reviewed_by: &str,
    ) -> Result<Review> {
        let policy = self.config.rejection_policy;
        let tx = self.tx()?;
        resolve_review(
            &tx,
            review_id,
            ReviewStatus::Rejected,
            reviewed_by,
            Some(reason),
        )?;

        if policy == RejectionPolicy::ReleaseTask {
            let gated: Option<String> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE blocks_on_review_id = ?1",
                    [review_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(task_id) = gated {
                let task = get_task_tx(&tx, &task_id)?;
                if task.status == TaskStatus::Review {
                    apply_task_status(&tx, &task, TaskStatus::Todo)?;
                    if let Some(epic_id) = &task.epic_id {
                        recompute_epic_status(&tx, epic_id)?;
                    }
                }
                tx.execute(
                    "UPDATE tasks SET blocks_on_review_id = NULL, current_mission_id = NULL,
                     updated_at = ?1 WHERE id = ?2",
                    params![now_str(), task_id],
                )?;
            }
        }

        let review = get_review_tx(&tx, review_id)?;
        tx.commit()?;
        tracing::info!(review = review_id, "review rejected");
        Ok(review)
    }

    /// Clear a task's review gate. This is a deliberate separate step;
    /// approving a review never does it implicitly.
    pub fn unblock_task(&mut self, task_id: &str) -> Result<Task> {
        let changed = self.conn.execute(
            "UPDATE tasks SET blocks_on_review_id = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_str(), task_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("task not found: {}", task_id)));
        }
        self.get_task(task_id)
    }

    /// Tasks currently gated by a pending review, with the blocking review.
    pub fn review_blocked_tasks(&self) -> Result<Vec<(String, Review)>> {
        let sql = format!(
            "SELECT t.id, {} FROM tasks t
             INNER JOIN reviews r ON t.blocks_on_review_id = r.id
             WHERE r.status = 'pending'
             ORDER BY r.requested_at DESC, r.id DESC",
            REVIEW_COLS_PREFIXED
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let task_id: String = row.get(0)?;
                let review = review_from_row_offset(row, 1)?;
                Ok((task_id, review))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // === Handoff Operations ===

    /// Create a handoff offering a task to a target role.
    pub fn create_handoff(&mut self, spec: NewHandoff) -> Result<Handoff> {
        let tx = self.tx()?;
        get_task_tx(&tx, &spec.task_id)?;
        get_mission_tx(&tx, spec.from_mission_id)?;

        let files_json = if spec.files.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&spec.files)?)
        };
        let now = now_str();
        tx.execute(
            r#"
            INSERT INTO handoffs (task_id, from_mission_id, to_role, status, summary,
                                  files, acceptance_criteria, notes, created_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                spec.task_id,
                spec.from_mission_id,
                spec.to_role.as_str(),
                spec.summary,
                files_json,
                spec.acceptance_criteria,
                spec.notes,
                now,
            ],
        )
        .map_err(db_write_err)?;
        let handoff_id = tx.last_insert_rowid();

        let handoff = get_handoff_tx(&tx, handoff_id)?;
        tx.commit()?;
        tracing::info!(handoff = handoff_id, task = %spec.task_id, "handoff created");
        Ok(handoff)
    }

    /// Accept a pending handoff, claiming its task for the accepting mission.
    ///
    /// The claim goes through the regular claim path, so a handoff can never
    /// bypass review gating or an existing claim; any claim failure rolls
    /// back the acceptance too.
    pub fn accept_handoff(&mut self, handoff_id: i64, mission_id: i64) -> Result<Handoff> {
        let tx = self.tx()?;
        let handoff = get_handoff_tx(&tx, handoff_id)?;
        if handoff.status != HandoffStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "handoff {} is {}, only pending handoffs can be accepted",
                handoff_id, handoff.status
            )));
        }
        get_mission_tx(&tx, mission_id)?;

        claim_task_tx(&tx, &handoff.task_id, mission_id)?;

        let now = now_str();
        tx.execute(
            "UPDATE handoffs SET status = 'accepted', to_mission_id = ?1, accepted_at = ?2 WHERE id = ?3",
            params![mission_id, now, handoff_id],
        )?;

        let handoff = get_handoff_tx(&tx, handoff_id)?;
        tx.commit()?;
        tracing::info!(handoff = handoff_id, mission = mission_id, "handoff accepted");
        Ok(handoff)
    }

    /// Mark an accepted handoff as completed.
    pub fn complete_handoff(&mut self, handoff_id: i64) -> Result<Handoff> {
        let tx = self.tx()?;
        let handoff = get_handoff_tx(&tx, handoff_id)?;
        if handoff.status != HandoffStatus::Accepted {
            return Err(Error::InvalidTransition(format!(
                "handoff {} is {}, only accepted handoffs can be completed",
                handoff_id, handoff.status
            )));
        }
        tx.execute(
            "UPDATE handoffs SET status = 'completed', completed_at = ?1 WHERE id = ?2",
            params![now_str(), handoff_id],
        )?;
        let handoff = get_handoff_tx(&tx, handoff_id)?;
        tx.commit()?;
        Ok(handoff)
    }

    /// Cancel a pending or accepted handoff.
    pub fn cancel_handoff(&mut self, handoff_id: i64) -> Result<Handoff> {
        let tx = self.tx()?;
        let handoff = get_handoff_tx(&tx, handoff_id)?;
        if !matches!(
            handoff.status,
            HandoffStatus::Pending | HandoffStatus::Accepted
        ) {
            return Err(Error::InvalidTransition(format!(
                "handoff {} is {}, cannot cancel",
                handoff_id, handoff.status
            )));
        }
        tx.execute(
            "UPDATE handoffs SET status = 'cancelled' WHERE id = ?1",
            [handoff_id],
        )?;
        let handoff = get_handoff_tx(&tx, handoff_id)?;
        tx.commit()?;
        Ok(handoff)
    }

    /// Get a handoff by ID.
    pub fn get_handoff(&self, handoff_id: i64) -> Result<Handoff> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM handoffs WHERE id = ?1", HANDOFF_COLS),
                [handoff_id],
                handoff_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("handoff not found: {}", handoff_id)))
    }

    /// List handoffs with optional filters, newest first.
    pub fn list_handoffs(
        &self,
        to_role: Option<Role>,
        status: Option<HandoffStatus>,
    ) -> Result<Vec<Handoff>> {
        let mut sql = format!("SELECT {} FROM handoffs WHERE 1=1", HANDOFF_COLS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(r) = to_role {
            sql.push_str(" AND to_role = ?");
            params_vec.push(Box::new(r.as_str().to_string()));
        }
        if let Some(s) = status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(s.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let handoffs = stmt
            .query_map(params_refs.as_slice(), handoff_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(handoffs)
    }

    /// All pending handoffs addressed to a role.
    pub fn pending_handoffs_for_role(&self, role: Role) -> Result<Vec<Handoff>> {
        self.list_handoffs(Some(role), Some(HandoffStatus::Pending))
    }

    // === Dependency Operations ===

    /// Record that `task_id` depends on `depends_on`. Dependencies are
    /// advisory: they are never enforced at claim time.
    pub fn add_dependency(&mut self, task_id: &str, depends_on: &str) -> Result<()> {
        if task_id == depends_on {
            return Err(Error::ConstraintViolation(format!(
                "task {} cannot depend on itself",
                task_id
            )));
        }
        self.get_task(task_id)?;
        self.get_task(depends_on)?;

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM task_dependencies WHERE task_id = ?1 AND depends_on_task_id = ?2",
                params![task_id, depends_on],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::ConstraintViolation(format!(
                "dependency {} -> {} already exists",
                task_id, depends_on
            )));
        }

        self.conn
            .execute(
                "INSERT INTO task_dependencies (task_id, depends_on_task_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![task_id, depends_on, now_str()],
            )
            .map_err(db_write_err)?;
        Ok(())
    }

    /// Remove a recorded dependency.
    pub fn remove_dependency(&mut self, task_id: &str, depends_on: &str) -> Result<()> {
        let changed = self.conn.execute(
            "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on_task_id = ?2",
            params![task_id, depends_on],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "dependency {} -> {} not found",
                task_id, depends_on
            )));
        }
        Ok(())
    }

    /// IDs of tasks this task depends on.
    pub fn dependencies_of(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on_task_id",
        )?;
        let ids = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// IDs of tasks that depend on this task.
    pub fn dependents_of(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id FROM task_dependencies WHERE depends_on_task_id = ?1 ORDER BY task_id",
        )?;
        let ids = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    // === Template Operations ===

    /// Create a reusable task template.
    pub fn create_template(&mut self, spec: NewTemplate) -> Result<TaskTemplate> {
        self.conn
            .execute(
                r#"
                INSERT INTO task_templates (name, role, priority, category, description, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    spec.name,
                    spec.role.as_str(),
                    spec.priority.as_str(),
                    spec.category.map(|c| c.as_str()),
                    spec.description,
                    now_str(),
                ],
            )
            .map_err(db_write_err)?;
        self.get_template(&spec.name)
    }

    /// Get a template by name.
    pub fn get_template(&self, name: &str) -> Result<TaskTemplate> {
        self.conn
            .query_row(
                "SELECT name, role, priority, category, description, created_at
                 FROM task_templates WHERE name = ?1",
                [name],
                template_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("template not found: {}", name)))
    }

    /// List all templates by name.
    pub fn list_templates(&self) -> Result<Vec<TaskTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, role, priority, category, description, created_at
             FROM task_templates ORDER BY name",
        )?;
        let templates = stmt
            .query_map([], template_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(templates)
    }

    /// Delete a template. Templates carry no history, so unlike tasks they
    /// may be removed physically.
    pub fn delete_template(&mut self, name: &str) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM task_templates WHERE name = ?1", [name])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("template not found: {}", name)));
        }
        Ok(())
    }

    /// Stamp out a new task from a template.
    pub fn create_task_from_template(&mut self, name: &str, title: &str) -> Result<Task> {
        let template = self.get_template(name)?;
        self.create_task(NewTask {
            title: title.to_string(),
            role: template.role,
            priority: template.priority,
            category: template.category,
            description: template.description,
            epic_id: None,
        })
    }

    /// Begin an IMMEDIATE transaction. Taking the write lock up front keeps
    /// read-modify-write sequences (claims, counters) race-free.
    fn tx(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

// === Column lists and row mappers ===

const TASK_COLS: &str = "id, title, status, priority, role, category, epic_id, \
     current_mission_id, blocks_on_review_id, description, notes, actual_hours, \
     claimed_at, closed_at, paused_at, created_at, updated_at";

const EPIC_COLS: &str = "id, title, description, status, priority, aborted_reason, \
     completed_at, aborted_at, created_at, updated_at";

const MISSION_COLS: &str =
    "id, persona_name, role, codename, objective, start_time, end_time, created_at, updated_at";

const REVIEW_COLS: &str = "id, review_type, status, task_id, title, description, \
     requested_by, requested_at, reviewed_by, reviewed_at, outcome_reason, artifact_path";

const REVIEW_COLS_PREFIXED: &str = "r.id, r.review_type, r.status, r.task_id, r.title, \
     r.description, r.requested_by, r.requested_at, r.reviewed_by, r.reviewed_at, \
     r.outcome_reason, r.artifact_path";

const HANDOFF_COLS: &str = "id, task_id, from_mission_id, to_role, to_mission_id, status, \
     summary, files, acceptance_criteria, notes, created_at, accepted_at, completed_at";

/// Wrap a domain error for use inside a rusqlite row-mapping closure.
fn sql_err<E>(e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(2)?;
    let priority: String = row.get(3)?;
    let role: String = row.get(4)?;
    let category: Option<String> = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        status: TaskStatus::parse(&status).map_err(sql_err)?,
        priority: Priority::parse(&priority).map_err(sql_err)?,
        role: Role::parse(&role).map_err(sql_err)?,
        category: category
            .map(|c| Category::parse(&c))
            .transpose()
            .map_err(sql_err)?,
        epic_id: row.get(6)?,
        current_mission_id: row.get(7)?,
        blocks_on_review_id: row.get(8)?,
        description: row.get(9)?,
        notes: row.get(10)?,
        actual_hours: row.get(11)?,
        claimed_at: parse_opt_ts(row.get(12)?)?,
        closed_at: parse_opt_ts(row.get(13)?)?,
        paused_at: parse_opt_ts(row.get(14)?)?,
        created_at: parse_ts(&row.get::<_, String>(15)?)?,
        updated_at: parse_ts(&row.get::<_, String>(16)?)?,
    })
}

fn epic_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Epic> {
    let status: String = row.get(3)?;
    let priority: String = row.get(4)?;
    Ok(Epic {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: EpicStatus::parse(&status).map_err(sql_err)?,
        priority: Priority::parse(&priority).map_err(sql_err)?,
        aborted_reason: row.get(5)?,
        completed_at: parse_opt_ts(row.get(6)?)?,
        aborted_at: parse_opt_ts(row.get(7)?)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
        updated_at: parse_ts(&row.get::<_, String>(9)?)?,
        subtask_count: 0,
        completed_count: 0,
    })
}

fn mission_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mission> {
    let role: String = row.get(2)?;
    Ok(Mission {
        id: row.get(0)?,
        persona_name: row.get(1)?,
        role: Role::parse(&role).map_err(sql_err)?,
        codename: row.get(3)?,
        objective: row.get(4)?,
        start_time: parse_ts(&row.get::<_, String>(5)?)?,
        end_time: parse_opt_ts(row.get(6)?)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        updated_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

fn persona_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Persona> {
    let role: String = row.get(1)?;
    Ok(Persona {
        name: row.get(0)?,
        role: Role::parse(&role).map_err(sql_err)?,
        mythology: row.get(2)?,
        description: row.get(3)?,
        mission_count: row.get(4)?,
        last_mission_at: parse_opt_ts(row.get(5)?)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn review_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Review> {
    review_from_row_offset(row, 0)
}

fn review_from_row_offset(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Review> {
    let review_type: String = row.get(base + 1)?;
    let status: String = row.get(base + 2)?;
    Ok(Review {
        id: row.get(base)?,
        review_type: ReviewType::parse(&review_type).map_err(sql_err)?,
        status: ReviewStatus::parse(&status).map_err(sql_err)?,
        task_id: row.get(base + 3)?,
        title: row.get(base + 4)?,
        description: row.get(base + 5)?,
        requested_by: row.get(base + 6)?,
        requested_at: parse_ts(&row.get::<_, String>(base + 7)?)?,
        reviewed_by: row.get(base + 8)?,
        reviewed_at: parse_opt_ts(row.get(base + 9)?)?,
        outcome_reason: row.get(base + 10)?,
        artifact_path: row.get(base + 11)?,
    })
}

fn handoff_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Handoff> {
    let to_role: String = row.get(3)?;
    let status: String = row.get(5)?;
    let files_json: Option<String> = row.get(7)?;
    let files = match files_json {
        Some(raw) => serde_json::from_str(&raw).map_err(sql_err)?,
        None => Vec::new(),
    };
    Ok(Handoff {
        id: row.get(0)?,
        task_id: row.get(1)?,
        from_mission_id: row.get(2)?,
        to_role: Role::parse(&to_role).map_err(sql_err)?,
        to_mission_id: row.get(4)?,
        status: HandoffStatus::parse(&status).map_err(sql_err)?,
        summary: row.get(6)?,
        files,
        acceptance_criteria: row.get(8)?,
        notes: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?)?,
        accepted_at: parse_opt_ts(row.get(11)?)?,
        completed_at: parse_opt_ts(row.get(12)?)?,
    })
}

fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskTemplate> {
    let role: String = row.get(1)?;
    let priority: String = row.get(2)?;
    let category: Option<String> = row.get(3)?;
    Ok(TaskTemplate {
        name: row.get(0)?,
        role: Role::parse(&role).map_err(sql_err)?,
        priority: Priority::parse(&priority).map_err(sql_err)?,
        category: category
            .map(|c| Category::parse(&c))
            .transpose()
            .map_err(sql_err)?,
        description: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

// === Transaction-scoped helpers ===

fn get_task_tx(tx: &Transaction<'_>, task_id: &str) -> Result<Task> {
    tx.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLS),
        [task_id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("task not found: {}", task_id)))
}

fn get_epic_tx(tx: &Transaction<'_>, epic_id: &str) -> Result<Epic> {
    let mut epic = tx
        .query_row(
            &format!("SELECT {} FROM epics WHERE id = ?1", EPIC_COLS),
            [epic_id],
            epic_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("epic not found: {}", epic_id)))?;
    let (total, complete) = epic_progress(tx, epic_id)?;
    epic.subtask_count = total;
    epic.completed_count = complete;
    Ok(epic)
}

fn ensure_epic_exists(tx: &Transaction<'_>, epic_id: &str) -> Result<()> {
    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM epics WHERE id = ?1", [epic_id], |row| {
            row.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(Error::NotFound(format!("epic not found: {}", epic_id)));
    }
    Ok(())
}

fn get_mission_tx(tx: &Transaction<'_>, mission_id: i64) -> Result<Mission> {
    tx.query_row(
        &format!("SELECT {} FROM missions WHERE id = ?1", MISSION_COLS),
        [mission_id],
        mission_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("mission not found: {}", mission_id)))
}

fn get_review_tx(tx: &Transaction<'_>, review_id: i64) -> Result<Review> {
    tx.query_row(
        &format!("SELECT {} FROM reviews WHERE id = ?1", REVIEW_COLS),
        [review_id],
        review_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("review not found: {}", review_id)))
}

fn get_handoff_tx(tx: &Transaction<'_>, handoff_id: i64) -> Result<Handoff> {
    tx.query_row(
        &format!("SELECT {} FROM handoffs WHERE id = ?1", HANDOFF_COLS),
        [handoff_id],
        handoff_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("handoff not found: {}", handoff_id)))
}

/// Advance the sequence counter for an ID prefix (e.g., "ENG-H", "EPC-C").
///
/// Dedicated counter row with an atomic upsert, so sequences survive aborted
/// entities and concurrent creators never mint the same number.
fn next_sequence(tx: &Transaction<'_>, prefix: &str) -> Result<u32> {
    let value: i64 = tx.query_row(
        "INSERT INTO counters (prefix, value) VALUES (?1, 1)
         ON CONFLICT(prefix) DO UPDATE SET value = value + 1
         RETURNING value",
        [prefix],
        |row| row.get(0),
    )?;
    if value > ids::MAX_SEQUENCE as i64 {
        return Err(Error::ConstraintViolation(format!(
            "sequence exhausted for prefix {}",
            prefix
        )));
    }
    Ok(value as u32)
}

/// Append to a task's free-text notes. Notes are never overwritten.
fn append_notes(tx: &Transaction<'_>, task_id: &str, notes: &str) -> Result<()> {
    tx.execute(
        "UPDATE tasks SET notes = CASE WHEN notes IS NULL OR notes = '' THEN ?1
                                       ELSE notes || char(10) || ?1 END,
                          updated_at = ?2
         WHERE id = ?3",
        params![notes, now_str(), task_id],
    )?;
    Ok(())
}

/// Set a task's status while keeping the timestamp invariants:
/// - `claimed_at` is set iff status != TODO (set on first leave, cleared on
///   return to TODO)
/// - `closed_at` is set iff status is COMPLETE/ABORTED/PAUSED, refreshed on
///   each entry into a closing status
/// - `paused_at` is set iff status is PAUSED
///
/// COMPLETE and ABORTED release the mission's claim here, so every path
/// into a terminal status behaves the same way. PAUSED and BLOCKED keep the
/// claim so the mission can resume.
fn apply_task_status(tx: &Transaction<'_>, task: &Task, new_status: TaskStatus) -> Result<()> {
    let now = Utc::now();
    let rfc = |t: DateTime<Utc>| t.to_rfc3339();

    let claimed_at = if new_status == TaskStatus::Todo {
        None
    } else {
        task.claimed_at.map(rfc).or_else(|| Some(rfc(now)))
    };
    let closed_at = if new_status.is_closing() {
        if task.status == new_status {
            task.closed_at.map(rfc)
        } else {
            Some(rfc(now))
        }
    } else {
        None
    };
    let paused_at = if new_status == TaskStatus::Paused {
        if task.status == TaskStatus::Paused {
            task.paused_at.map(rfc)
        } else {
            Some(rfc(now))
        }
    } else {
        None
    };
    let mission_id = if matches!(new_status, TaskStatus::Complete | TaskStatus::Aborted) {
        None
    } else {
        task.current_mission_id
    };

    tx.execute(
        "UPDATE tasks SET status = ?1, claimed_at = ?2, closed_at = ?3, paused_at = ?4,
                          current_mission_id = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            new_status.as_str(),
            claimed_at,
            closed_at,
            paused_at,
            mission_id,
            rfc(now),
            task.id
        ],
    )?;
    if task.status != new_status {
        tracing::debug!(task = %task.id, from = %task.status, to = %new_status, "task status changed");
    }
    Ok(())
}

/// Claim validation and mutation, shared by `claim_task` and
/// `accept_handoff`. Runs inside the caller's transaction.
fn claim_task_tx(tx: &Transaction<'_>, task_id: &str, mission_id: i64) -> Result<Task> {
    let task = get_task_tx(tx, task_id)?;
    get_mission_tx(tx, mission_id)?;

    if let Some(holder) = task.current_mission_id {
        if holder != mission_id {
            return Err(Error::AlreadyClaimed {
                task_id: task_id.to_string(),
                mission_id: holder,
            });
        }
    }

    if let Some(review_id) = task.blocks_on_review_id {
        let status: String = tx.query_row(
            "SELECT status FROM reviews WHERE id = ?1",
            [review_id],
            |row| row.get(0),
        )?;
        if ReviewStatus::parse(&status)? == ReviewStatus::Pending {
            return Err(Error::ReviewBlocked {
                task_id: task_id.to_string(),
                review_id,
            });
        }
    }

    if matches!(task.status, TaskStatus::Complete | TaskStatus::Aborted) {
        return Err(Error::InvalidTransition(format!(
            "task {} is {}, not claimable",
            task_id, task.status
        )));
    }

    apply_task_status(tx, &task, TaskStatus::Underway)?;
    tx.execute(
        "UPDATE tasks SET current_mission_id = ?1 WHERE id = ?2",
        params![mission_id, task_id],
    )?;
    if let Some(epic_id) = &task.epic_id {
        recompute_epic_status(tx, epic_id)?;
    }
    get_task_tx(tx, task_id)
}

/// Resolve a pending review to approved/rejected.
fn resolve_review(
    tx: &Transaction<'_>,
    review_id: i64,
    outcome: ReviewStatus,
    reviewed_by: &str,
    reason: Option<&str>,
) -> Result<()> {
    let review = get_review_tx(tx, review_id)?;
    if review.status != ReviewStatus::Pending {
        return Err(Error::InvalidTransition(format!(
            "review {} is already {}",
            review_id, review.status
        )));
    }
    tx.execute(
        "UPDATE reviews SET status = ?1, reviewed_by = ?2, reviewed_at = ?3, outcome_reason = ?4
         WHERE id = ?5",
        params![outcome.as_str(), reviewed_by, now_str(), reason, review_id],
    )?;
    Ok(())
}

/// Subtask progress for an epic: (total, complete).
fn epic_progress(conn: &Connection, epic_id: &str) -> Result<(usize, usize)> {
    let (total, complete): (i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'COMPLETE' THEN 1 ELSE 0 END), 0)
         FROM tasks WHERE epic_id = ?1",
        [epic_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((total as usize, complete as usize))
}

/// Recompute an epic's derived status from its subtask statuses.
///
/// Pure reduction over the status multiset, so it is idempotent and
/// order-independent:
/// 1. no subtasks: keep the current status
/// 2. all COMPLETE: epic COMPLETE, `completed_at` backfilled once
/// 3. any UNDERWAY/BLOCKED/PAUSED/REVIEW: epic UNDERWAY
/// 4. otherwise (TODO/ABORTED mix, not all complete): epic TODO
///
/// ABORTED epics are sticky and skipped. A COMPLETE+ABORTED-only mix lands
/// in TODO, never COMPLETE: partial abandonment must not read as finished.
fn recompute_epic_status(tx: &Transaction<'_>, epic_id: &str) -> Result<()> {
    let row: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT status, completed_at FROM epics WHERE id = ?1",
            [epic_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    // A vanished epic row fails the whole originating transaction rather
    // than leaving the task changed with stale derived state
    let (status_raw, completed_at) =
        row.ok_or_else(|| Error::NotFound(format!("epic not found: {}", epic_id)))?;
    let old_status = EpicStatus::parse(&status_raw)?;
    if old_status == EpicStatus::Aborted {
        return Ok(());
    }

    let (total, complete, active): (i64, i64, i64) = tx.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'COMPLETE' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status IN ('UNDERWAY','BLOCKED','PAUSED','REVIEW')
                             THEN 1 ELSE 0 END), 0)
         FROM tasks WHERE epic_id = ?1",
        [epic_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    if total == 0 {
        return Ok(());
    }

    let new_status = if complete == total {
        EpicStatus::Complete
    } else if active > 0 {
        EpicStatus::Underway
    } else {
        EpicStatus::Todo
    };

    let new_completed_at = if new_status == EpicStatus::Complete {
        completed_at.or_else(|| Some(now_str()))
    } else {
        None
    };

    tx.execute(
        "UPDATE epics SET status = ?1, completed_at = ?2, updated_at = ?3 WHERE id = ?4",
        params![new_status.as_str(), new_completed_at, now_str(), epic_id],
    )?;
    if new_status != old_status {
        tracing::debug!(epic = epic_id, from = %old_status, to = %new_status, "epic status recomputed");
    }
    Ok(())
}

// === Path helpers ===

/// Get the storage directory for a project.
///
/// Uses a hash of the project path to create a unique directory under the
/// platform data dir (e.g., `~/.local/share/waystation/<hash>/`).
pub fn get_storage_dir(project_path: &Path) -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("waystation").join(project_hash(project_path)?))
}

/// Short hash identifying a project by its canonical path.
fn project_hash(project_path: &Path) -> Result<String> {
    let canonical = project_path
        .canonicalize()
        .map_err(|e| Error::Other(format!("Could not canonicalize project path: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());
    Ok(hash_hex[..12].to_string())
}

/// Map constraint failures from SQLite into the typed domain error.
fn db_write_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::ConstraintViolation(msg.clone().unwrap_or_else(|| err.to_string()))
        }
        _ => Error::Database(e),
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp. A malformed value is corruption and
/// fails the read rather than being papered over.
fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(sql_err)
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}
