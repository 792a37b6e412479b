//! End-to-end lifecycle tests driving the public API the way an agent
//! harness would: summon a persona, start a mission, work tasks through an
//! epic, hand off, review, and close out.

use tempfile::TempDir;
use waystation::config::{RejectionPolicy, WorkflowConfig};
use waystation::models::{
    Category, EpicStatus, HandoffStatus, Priority, ReviewType, Role, TaskStatus,
};
use waystation::storage::{NewHandoff, NewReview, NewTask, Storage, TaskFilter};
use waystation::Error;

struct Harness {
    project: TempDir,
    data: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            project: TempDir::new().unwrap(),
            data: TempDir::new().unwrap(),
        }
    }

    fn init(&self) -> Storage {
        Storage::init_with_data_dir(self.project.path(), self.data.path()).unwrap()
    }

    fn open(&self) -> Storage {
        Storage::open_with_data_dir(self.project.path(), self.data.path()).unwrap()
    }
}

/// A full feature push: epic with three tasks, worked by two missions,
/// gated by a review, finished with a handoff to a tester.
#[test]
fn test_full_feature_push() {
    let harness = Harness::new();
    let mut storage = harness.init();

    storage
        .add_persona("Hephaestus", Role::Engineer, "Greek", Some("the forge"))
        .unwrap();
    storage
        .add_persona("Heimdall", Role::Tester, "Norse", None)
        .unwrap();
    let eng_mission = storage
        .start_mission(
            "Hephaestus",
            Role::Engineer,
            "iron-anvil",
            "ship the parser rewrite",
        )
        .unwrap();
    let tst_mission = storage
        .start_mission("Heimdall", Role::Tester, "keen-watch", "verify the rewrite")
        .unwrap();

    let epic = storage
        .create_epic("Parser rewrite", Priority::High, Some("replace the old parser"))
        .unwrap();
    assert_eq!(epic.id, "EPC-H-0001");
    assert_eq!(epic.status, EpicStatus::Todo);

    let lexer = storage
        .create_task(
            NewTask::new("Rework lexer", Role::Engineer, Priority::High)
                .with_epic(&epic.id)
                .with_category(Category::Refactor),
        )
        .unwrap();
    let grammar = storage
        .create_task(
            NewTask::new("New grammar tables", Role::Engineer, Priority::High).with_epic(&epic.id),
        )
        .unwrap();
    let verify = storage
        .create_task(
            NewTask::new("Verify against corpus", Role::Tester, Priority::High)
                .with_epic(&epic.id)
                .with_category(Category::Testing),
        )
        .unwrap();
    assert_eq!(lexer.id, "ENG-H-0001");
    assert_eq!(grammar.id, "ENG-H-0002");
    assert_eq!(verify.id, "TST-H-0001");

    // Engineer works the first two tasks
    storage.claim_task(&lexer.id, eng_mission.id).unwrap();
    assert_eq!(
        storage.get_epic(&epic.id).unwrap().status,
        EpicStatus::Underway
    );
    storage
        .close_task(&lexer.id, TaskStatus::Complete, Some("lexer done"))
        .unwrap();

    storage.claim_task(&grammar.id, eng_mission.id).unwrap();

    // The tester's task goes under review before anyone claims it
    let review = storage
        .create_review(
            NewReview::new(ReviewType::TaskCompletion, "corpus selection sign-off")
                .for_task(&verify.id),
        )
        .unwrap();
    match storage.claim_task(&verify.id, tst_mission.id) {
        Err(Error::ReviewBlocked { review_id, .. }) => assert_eq!(review_id, review.id),
        other => panic!("expected ReviewBlocked, got {:?}", other.map(|t| t.id)),
    }
    storage
        .approve_review(review.id, "Hephaestus", Some("corpus looks right"))
        .unwrap();

    // Engineer finishes and hands the verification task to the tester role
    storage
        .close_task(&grammar.id, TaskStatus::Complete, None)
        .unwrap();
    let handoff = storage
        .create_handoff(NewHandoff {
            task_id: verify.id.clone(),
            from_mission_id: eng_mission.id,
            to_role: Role::Tester,
            summary: "parser rewrite ready for verification".to_string(),
            files: vec!["src/parser.rs".to_string(), "src/lexer.rs".to_string()],
            acceptance_criteria: Some("full corpus parses clean".to_string()),
            notes: None,
        })
        .unwrap();
    storage.end_mission(eng_mission.id).unwrap();

    // Tester picks it up via the handoff
    let pending = storage.pending_handoffs_for_role(Role::Tester).unwrap();
    assert_eq!(pending.len(), 1);
    let accepted = storage.accept_handoff(handoff.id, tst_mission.id).unwrap();
    assert_eq!(accepted.status, HandoffStatus::Accepted);
    let verify_check = storage.get_task(&verify.id).unwrap();
    assert_eq!(verify_check.status, TaskStatus::Underway);
    assert_eq!(verify_check.current_mission_id, Some(tst_mission.id));

    storage
        .close_task(&verify.id, TaskStatus::Complete, Some("corpus clean"))
        .unwrap();
    storage.complete_handoff(handoff.id).unwrap();
    storage.end_mission(tst_mission.id).unwrap();

    // With all three subtasks complete the epic completed itself
    let epic = storage.get_epic(&epic.id).unwrap();
    assert_eq!(epic.status, EpicStatus::Complete);
    assert_eq!(epic.completed_count, 3);
    assert!(epic.completed_at.is_some());
    assert!(!epic.is_open());

    assert!(storage.list_missions(true, None).unwrap().is_empty());
}

/// State survives a full close-and-reopen, including derived epic status
/// and the sequence counters.
#[test]
fn test_reopen_resumes_where_left_off() {
    let harness = Harness::new();

    let epic_id;
    let task_id;
    {
        let mut storage = harness.init();
        let epic = storage.create_epic("Durable", Priority::Medium, None).unwrap();
        let task = storage
            .create_task(
                NewTask::new("survives restart", Role::Engineer, Priority::Medium)
                    .with_epic(&epic.id),
            )
            .unwrap();
        storage
            .close_task(&task.id, TaskStatus::Complete, None)
            .unwrap();
        epic_id = epic.id;
        task_id = task.id;
    }

    let mut storage = harness.open();
    let epic = storage.get_epic(&epic_id).unwrap();
    assert_eq!(epic.status, EpicStatus::Complete);
    assert_eq!(
        storage.get_task(&task_id).unwrap().status,
        TaskStatus::Complete
    );

    // Counters resume; no ID reuse after reopen
    let next = storage
        .create_task(NewTask::new("next up", Role::Engineer, Priority::Medium))
        .unwrap();
    assert_eq!(next.id, "ENG-M-0002");
}

/// Aborting an epic mid-flight cascades and stays sticky across reopen.
#[test]
fn test_abort_epic_cascade_persists() {
    let harness = Harness::new();
    let mut storage = harness.init();

    storage
        .add_persona("Loki", Role::Engineer, "Norse", None)
        .unwrap();
    let mission = storage
        .start_mission("Loki", Role::Engineer, "wild-card", "doomed work")
        .unwrap();

    let epic = storage.create_epic("Descoped", Priority::Low, None).unwrap();
    let active = storage
        .create_task(NewTask::new("in flight", Role::Engineer, Priority::Low).with_epic(&epic.id))
        .unwrap();
    let idle = storage
        .create_task(NewTask::new("never started", Role::Engineer, Priority::Low).with_epic(&epic.id))
        .unwrap();
    storage.claim_task(&active.id, mission.id).unwrap();

    storage.abort_epic(&epic.id, "priorities changed").unwrap();
    drop(storage);

    let storage = harness.open();
    let epic = storage.get_epic(&epic.id).unwrap();
    assert_eq!(epic.status, EpicStatus::Aborted);
    assert_eq!(epic.aborted_reason.as_deref(), Some("priorities changed"));
    for id in [&active.id, &idle.id] {
        let task = storage.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Aborted);
        assert!(task.current_mission_id.is_none());
        assert!(task.claimed_at.is_some());
        assert!(task.closed_at.is_some());
    }

    // The aborted tasks are still listable for the record
    let aborted = storage
        .list_tasks(&TaskFilter {
            status: Some(TaskStatus::Aborted),
            ..TaskFilter::default()
        })
        .unwrap();
    assert_eq!(aborted.len(), 2);
}

/// The release-task rejection policy persists through the config file and
/// changes what rejection does.
#[test]
fn test_rejection_policy_round_trips_through_config() {
    let harness = Harness::new();
    {
        let mut storage = harness.init();
        storage
            .set_config(WorkflowConfig {
                rejection_policy: RejectionPolicy::ReleaseTask,
            })
            .unwrap();
    }

    let mut storage = harness.open();
    assert_eq!(
        storage.config().rejection_policy,
        RejectionPolicy::ReleaseTask
    );

    let task = storage
        .create_task(NewTask::new("gated", Role::Designer, Priority::High))
        .unwrap();
    let review = storage
        .create_review(NewReview::new(ReviewType::Design, "mockups").for_task(&task.id))
        .unwrap();
    storage
        .reject_review(review.id, "wrong direction", "Director")
        .unwrap();

    let task = storage.get_task(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
    assert!(task.blocks_on_review_id.is_none());
    assert!(task.claimed_at.is_none());
}

#[test]
fn test_open_before_init_fails() {
    let harness = Harness::new();
    assert!(matches!(
        Storage::open_with_data_dir(harness.project.path(), harness.data.path()),
        Err(Error::NotInitialized)
    ));
    // init then open succeeds
    harness.init();
    harness.open();
}
