//! Data models for Waystation entities.
//!
//! This module defines the core data structures:
//! - `Task` - Units of work with status, priority, role, and review gating
//! - `Epic` - Containers aggregating tasks, with derived status
//! - `Mission` - One tracked work session bound to a persona and role
//! - `Persona` - Reusable named identity with mythological flavor
//! - `Review` - Approval gate that can block a task from being claimed
//! - `Handoff` - Transfer of a task from one mission to a target role
//! - `TaskTemplate` - Reusable stamp for recurring tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Task status in the workflow.
///
/// The `claimed_at`/`closed_at`/`paused_at` timestamps on [`Task`] are kept
/// in lockstep with this enum by the storage layer: `claimed_at` is set iff
/// the status is not `Todo`, `closed_at` iff the status is closing
/// (`Complete`/`Aborted`/`Paused`), and `paused_at` iff the status is
/// `Paused`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Todo,
    Underway,
    Blocked,
    Paused,
    Review,
    Complete,
    Aborted,
}

impl TaskStatus {
    /// Statuses that count as active work for epic propagation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Underway | TaskStatus::Blocked | TaskStatus::Paused | TaskStatus::Review
        )
    }

    /// Statuses that set `closed_at` on a task.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Aborted | TaskStatus::Paused
        )
    }

    /// Statuses accepted by `close_task`.
    pub fn is_closable_target(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Paused | TaskStatus::Blocked | TaskStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::Underway => "UNDERWAY",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Review => "REVIEW",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TODO" => Ok(TaskStatus::Todo),
            "UNDERWAY" => Ok(TaskStatus::Underway),
            "BLOCKED" => Ok(TaskStatus::Blocked),
            "PAUSED" => Ok(TaskStatus::Paused),
            "REVIEW" => Ok(TaskStatus::Review),
            "COMPLETE" => Ok(TaskStatus::Complete),
            "ABORTED" => Ok(TaskStatus::Aborted),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid task status: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Epic status. Derived from subtask statuses except `Aborted`, which is
/// sticky and set only by an explicit abort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpicStatus {
    #[default]
    Todo,
    Underway,
    Complete,
    Aborted,
}

impl EpicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpicStatus::Todo => "TODO",
            EpicStatus::Underway => "UNDERWAY",
            EpicStatus::Complete => "COMPLETE",
            EpicStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TODO" => Ok(EpicStatus::Todo),
            "UNDERWAY" => Ok(EpicStatus::Underway),
            "COMPLETE" => Ok(EpicStatus::Complete),
            "ABORTED" => Ok(EpicStatus::Aborted),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid epic status: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task and epic priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Single-letter code used in structured IDs.
    pub fn code(&self) -> char {
        match self {
            Priority::Critical => 'C',
            Priority::High => 'H',
            Priority::Medium => 'M',
            Priority::Low => 'L',
        }
    }

    /// Inverse of [`Priority::code`].
    pub fn from_code(c: char) -> Result<Self> {
        match c {
            'C' => Ok(Priority::Critical),
            'H' => Ok(Priority::High),
            'M' => Ok(Priority::Medium),
            'L' => Ok(Priority::Low),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid priority code: {}",
                c
            ))),
        }
    }

    /// Sort rank; lower sorts first (CRITICAL before LOW).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Ok(Priority::Critical),
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid priority: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent roles. The three-letter prefix is part of the task ID contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Manager,
    Architect,
    Engineer,
    Tester,
    Documentarian,
    Designer,
    Inspector,
    Operator,
    Historian,
}

impl Role {
    /// Three-letter prefix used in structured task IDs.
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Manager => "MAN",
            Role::Architect => "ARC",
            Role::Engineer => "ENG",
            Role::Tester => "TST",
            Role::Documentarian => "DOC",
            Role::Designer => "DES",
            Role::Inspector => "INS",
            Role::Operator => "OPR",
            Role::Historian => "HIS",
        }
    }

    /// Inverse of [`Role::prefix`].
    pub fn from_prefix(prefix: &str) -> Result<Self> {
        match prefix {
            "MAN" => Ok(Role::Manager),
            "ARC" => Ok(Role::Architect),
            "ENG" => Ok(Role::Engineer),
            "TST" => Ok(Role::Tester),
            "DOC" => Ok(Role::Documentarian),
            "DES" => Ok(Role::Designer),
            "INS" => Ok(Role::Inspector),
            "OPR" => Ok(Role::Operator),
            "HIS" => Ok(Role::Historian),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid role prefix: {}",
                prefix
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "Manager",
            Role::Architect => "Architect",
            Role::Engineer => "Engineer",
            Role::Tester => "Tester",
            Role::Documentarian => "Documentarian",
            Role::Designer => "Designer",
            Role::Inspector => "Inspector",
            Role::Operator => "Operator",
            Role::Historian => "Historian",
        }
    }

    /// Parse from role name, case-insensitive.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "manager" => Ok(Role::Manager),
            "architect" => Ok(Role::Architect),
            "engineer" => Ok(Role::Engineer),
            "tester" => Ok(Role::Tester),
            "documentarian" => Ok(Role::Documentarian),
            "designer" => Ok(Role::Designer),
            "inspector" => Ok(Role::Inspector),
            "operator" => Ok(Role::Operator),
            "historian" => Ok(Role::Historian),
            _ => Err(Error::ConstraintViolation(format!("invalid role: {}", s))),
        }
    }

    /// All roles, in prefix order.
    pub fn all() -> &'static [Role] {
        &[
            Role::Manager,
            Role::Architect,
            Role::Engineer,
            Role::Tester,
            Role::Documentarian,
            Role::Designer,
            Role::Inspector,
            Role::Operator,
            Role::Historian,
        ]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review request types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    Code,
    TaskCompletion,
    Design,
    #[default]
    General,
}

impl ReviewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewType::Code => "code",
            ReviewType::TaskCompletion => "task_completion",
            ReviewType::Design => "design",
            ReviewType::General => "general",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "code" => Ok(ReviewType::Code),
            "task_completion" => Ok(ReviewType::TaskCompletion),
            "design" => Ok(ReviewType::Design),
            "general" => Ok(ReviewType::General),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid review type: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ReviewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review resolution status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ReviewStatus::Pending),
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid review status: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handoff state machine: pending → accepted → completed, or cancelled
/// out of pending/accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    #[default]
    Pending,
    Accepted,
    Completed,
    Cancelled,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Accepted => "accepted",
            HandoffStatus::Completed => "completed",
            HandoffStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(HandoffStatus::Pending),
            "accepted" => Ok(HandoffStatus::Accepted),
            "completed" => Ok(HandoffStatus::Completed),
            "cancelled" | "canceled" => Ok(HandoffStatus::Cancelled),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid handoff status: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional task categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Feature,
    BugFix,
    Refactor,
    Documentation,
    Testing,
    Infrastructure,
    Security,
    Performance,
    Architecture,
    Maintenance,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Feature => "feature",
            Category::BugFix => "bug-fix",
            Category::Refactor => "refactor",
            Category::Documentation => "documentation",
            Category::Testing => "testing",
            Category::Infrastructure => "infrastructure",
            Category::Security => "security",
            Category::Performance => "performance",
            Category::Architecture => "architecture",
            Category::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "feature" => Ok(Category::Feature),
            "bug-fix" | "bugfix" => Ok(Category::BugFix),
            "refactor" => Ok(Category::Refactor),
            "documentation" => Ok(Category::Documentation),
            "testing" => Ok(Category::Testing),
            "infrastructure" => Ok(Category::Infrastructure),
            "security" => Ok(Category::Security),
            "performance" => Ok(Category::Performance),
            "architecture" => Ok(Category::Architecture),
            "maintenance" => Ok(Category::Maintenance),
            _ => Err(Error::ConstraintViolation(format!(
                "invalid category: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked by Waystation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Structured identifier (e.g., "ENG-H-0042")
    pub id: String,

    /// Task title
    pub title: String,

    /// Current status
    pub status: TaskStatus,

    /// Priority level
    pub priority: Priority,

    /// Role the task is intended for
    pub role: Role,

    /// Optional categorization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,

    /// Epic this task belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,

    /// Mission currently holding the claim, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_mission_id: Option<i64>,

    /// Review that must resolve before this task can be claimed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks_on_review_id: Option<i64>,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Append-only free-text notes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Total hours spent; overwritten on update, not accumulated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,

    /// Set when the task first leaves TODO
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Set while the task is COMPLETE, ABORTED, or PAUSED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Set while the task is PAUSED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// An organizational container aggregating tasks.
///
/// `status` is a pure function of the subtask statuses, recomputed by the
/// storage layer inside every transaction that touches a subtask. The only
/// exception is `Aborted`, which is sticky.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    /// Structured identifier (e.g., "EPC-H-0001")
    pub id: String,

    /// Epic title
    pub title: String,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Derived status
    pub status: EpicStatus,

    /// Priority level
    pub priority: Priority,

    /// Reason recorded when the epic was aborted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_reason: Option<String>,

    /// Set when all subtasks completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Set when the epic was aborted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Number of subtasks (computed, not stored)
    pub subtask_count: usize,

    /// Number of COMPLETE subtasks (computed, not stored)
    pub completed_count: usize,
}

impl Epic {
    /// Completion percentage (0-100) from subtask counts.
    pub fn progress_percent(&self) -> u8 {
        if self.subtask_count == 0 {
            return 0;
        }
        ((self.completed_count as f64 / self.subtask_count as f64) * 100.0) as u8
    }

    /// Whether the epic still has active work.
    pub fn is_open(&self) -> bool {
        matches!(self.status, EpicStatus::Todo | EpicStatus::Underway)
    }
}

/// A reusable named identity with a role affinity.
///
/// Personas are never deleted; they anchor referential integrity for
/// missions. Only the bio and usage stats change after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Unique persona name
    pub name: String,

    /// Role affinity
    pub role: Role,

    /// Mythological origin tag (e.g., "Greek", "Norse")
    pub mythology: String,

    /// Free-text bio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Number of missions this persona has been summoned for
    pub mission_count: i64,

    /// When the persona was last summoned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mission_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One work assignment binding a persona, role, codename, and objective.
///
/// Active iff `end_time` is unset. Missions persist across any number of
/// external session restarts; they end only when explicitly ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    /// Database rowid
    pub id: i64,

    /// Persona summoned for this mission
    pub persona_name: String,

    /// Role the mission runs under
    pub role: Role,

    /// Opaque codename supplied by the caller at creation
    pub codename: String,

    /// What the mission set out to do
    pub objective: String,

    /// When the mission started
    pub start_time: DateTime<Utc>,

    /// When the mission ended; None while active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    /// Whether the mission is still running.
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// An approval gate, optionally tied to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    /// Database rowid
    pub id: i64,

    /// What kind of review this is
    pub review_type: ReviewType,

    /// Resolution status
    pub status: ReviewStatus,

    /// Task gated by this review, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Brief title of what is being reviewed
    pub title: String,

    /// Detailed description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Who requested the review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,

    /// When the review was requested
    pub requested_at: DateTime<Utc>,

    /// Who resolved the review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,

    /// When the review was resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,

    /// Reason recorded at approval/rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_reason: Option<String>,

    /// Path to the artifact under review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

/// Transfer of a task from one mission to a target role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    /// Database rowid
    pub id: i64,

    /// Task being handed off
    pub task_id: String,

    /// Mission creating the handoff
    pub from_mission_id: i64,

    /// Role that should pick up the work
    pub to_role: Role,

    /// Mission that accepted the handoff, once accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_mission_id: Option<i64>,

    /// Handoff state
    pub status: HandoffStatus,

    /// Brief summary of what is being handed off
    pub summary: String,

    /// Relevant file paths
    #[serde(default)]
    pub files: Vec<String>,

    /// What defines completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,

    /// Additional context or instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the handoff was accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,

    /// When the handoff was completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A reusable stamp for recurring tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Unique template name
    pub name: String,

    /// Role for tasks created from this template
    pub role: Role,

    /// Priority for tasks created from this template
    pub priority: Priority,

    /// Optional categorization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,

    /// Description copied onto created tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trip() {
        for s in [
            TaskStatus::Todo,
            TaskStatus::Underway,
            TaskStatus::Blocked,
            TaskStatus::Paused,
            TaskStatus::Review,
            TaskStatus::Complete,
            TaskStatus::Aborted,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(TaskStatus::parse("DONE").is_err());
    }

    #[test]
    fn test_task_status_classification() {
        assert!(TaskStatus::Underway.is_active());
        assert!(TaskStatus::Review.is_active());
        assert!(!TaskStatus::Todo.is_active());
        assert!(!TaskStatus::Complete.is_active());
        assert!(!TaskStatus::Aborted.is_active());

        assert!(TaskStatus::Paused.is_closing());
        assert!(!TaskStatus::Blocked.is_closing());

        assert!(TaskStatus::Blocked.is_closable_target());
        assert!(!TaskStatus::Underway.is_closable_target());
        assert!(!TaskStatus::Todo.is_closable_target());
    }

    #[test]
    fn test_priority_codes() {
        assert_eq!(Priority::Critical.code(), 'C');
        assert_eq!(Priority::from_code('L').unwrap(), Priority::Low);
        assert!(Priority::from_code('X').is_err());
        assert!(Priority::Critical.rank() < Priority::Low.rank());
    }

    #[test]
    fn test_role_prefixes_unique() {
        let mut prefixes: Vec<&str> = Role::all().iter().map(|r| r.prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), 9);
        for role in Role::all() {
            assert_eq!(Role::from_prefix(role.prefix()).unwrap(), *role);
            assert_eq!(Role::parse(role.as_str()).unwrap(), *role);
        }
    }

    #[test]
    fn test_role_parse_case_insensitive() {
        assert_eq!(Role::parse("engineer").unwrap(), Role::Engineer);
        assert_eq!(Role::parse("ENGINEER").unwrap(), Role::Engineer);
        assert!(Role::parse("builder").is_err());
    }

    #[test]
    fn test_review_and_handoff_status_parse() {
        assert_eq!(
            ReviewType::parse("task_completion").unwrap(),
            ReviewType::TaskCompletion
        );
        assert_eq!(
            ReviewStatus::parse("pending").unwrap(),
            ReviewStatus::Pending
        );
        assert_eq!(
            HandoffStatus::parse("canceled").unwrap(),
            HandoffStatus::Cancelled
        );
        assert!(HandoffStatus::parse("done").is_err());
    }

    #[test]
    fn test_epic_progress_percent() {
        let now = Utc::now();
        let mut epic = Epic {
            id: "EPC-H-0001".to_string(),
            title: "Test".to_string(),
            description: None,
            status: EpicStatus::Todo,
            priority: Priority::High,
            aborted_reason: None,
            completed_at: None,
            aborted_at: None,
            created_at: now,
            updated_at: now,
            subtask_count: 0,
            completed_count: 0,
        };
        assert_eq!(epic.progress_percent(), 0);
        epic.subtask_count = 4;
        epic.completed_count = 3;
        assert_eq!(epic.progress_percent(), 75);
    }
}
