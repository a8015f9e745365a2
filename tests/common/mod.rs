#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use ralph::backlog;
use ralph::types::{AcceptanceCriterion, BacklogIndex, Story};

/// Creates a `Story` with minimal defaults.
///
/// All optional fields are `None`, collections empty, `passes` false.
/// The title is auto-generated as `"Test story {id}"`.
pub fn make_story(id: &str) -> Story {
    Story {
        id: id.to_string(),
        title: format!("Test story {}", id),
        ..Default::default()
    }
}

/// Creates a `Story` blocked on another story id.
pub fn make_blocked_story(id: &str, blocker: &str) -> Story {
    let mut story = make_story(id);
    story.blocked_by = Some(blocker.to_string());
    story
}

/// Creates a `Story` with the given acceptance criteria texts, all
/// unchecked.
pub fn make_story_with_criteria(id: &str, criteria: &[&str]) -> Story {
    let mut story = make_story(id);
    story.acceptance_criteria = criteria
        .iter()
        .map(|text| AcceptanceCriterion {
            text: text.to_string(),
            checked: false,
        })
        .collect();
    story
}

/// Creates a `BacklogIndex` whose pending list is `pending`, blocked list
/// is `blocked`, completed list is `completed`, with `story_order` the
/// concatenation and `next_story` recomputed from the head of pending.
pub fn make_index(pending: &[&str], blocked: &[&str], completed: &[&str]) -> BacklogIndex {
    let mut story_order: Vec<String> = Vec::new();
    for id in pending.iter().chain(blocked.iter()).chain(completed.iter()) {
        story_order.push(id.to_string());
    }
    BacklogIndex {
        story_order,
        pending: pending.iter().map(|s| s.to_string()).collect(),
        blocked: blocked.iter().map(|s| s.to_string()).collect(),
        completed: completed.iter().map(|s| s.to_string()).collect(),
        next_story: pending.first().map(|s| s.to_string()),
        ..Default::default()
    }
}

/// Creates a temp backlog directory populated with the given index and
/// stories. Returns the `TempDir` handle (the backlog root) -- cleaned up
/// on drop.
pub fn setup_prd_dir(index: &BacklogIndex, stories: &[Story]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    backlog::write_index(dir.path(), index).expect("Failed to write index");
    for story in stories {
        backlog::write_story(dir.path(), story).expect("Failed to write story");
    }
    dir
}

/// Asserts the structural invariants that must hold after every write:
/// pairwise-disjoint pending/blocked/completed, membership in story_order,
/// and next_story equal to the head of pending.
pub fn assert_invariants(prd_dir: &Path) {
    let index = backlog::read_index(prd_dir).expect("index must be readable");

    for p in &index.pending {
        assert!(!index.blocked.contains(p), "{} in pending and blocked", p);
        assert!(
            !index.completed.contains(p),
            "{} in pending and completed",
            p
        );
    }
    for b in &index.blocked {
        assert!(
            !index.completed.contains(b),
            "{} in blocked and completed",
            b
        );
    }

    for id in index
        .pending
        .iter()
        .chain(index.blocked.iter())
        .chain(index.completed.iter())
    {
        assert!(
            index.story_order.contains(id),
            "{} missing from story_order",
            id
        );
    }

    assert_eq!(
        index.next_story,
        index.pending.first().cloned(),
        "next_story must equal head of pending"
    );
}

/// Write an arbitrary JSON string as the update queue document.
pub fn write_update_queue(prd_dir: &Path, json: &str) -> PathBuf {
    let path = backlog::update_queue_path(prd_dir);
    std::fs::write(&path, json).expect("Failed to write update.json");
    path
}
