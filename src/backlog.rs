use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::RalphError;
use crate::log_warn;
use crate::types::{BacklogIndex, Story, UpdateOutcome, UpdateQueue};

/// Resolution of `auto_block_story_if_needed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoBlockResolution {
    /// The blocker was already completed; `blocked_by` cleared, story kept
    /// in pending.
    Unblocked,
    /// The blocker is still live; story moved from pending to blocked.
    Blocked,
}

pub fn index_path(prd_dir: &Path) -> PathBuf {
    prd_dir.join("index.json")
}

pub fn story_path(prd_dir: &Path, id: &str) -> PathBuf {
    prd_dir.join("stories").join(format!("{}.json", id))
}

pub fn update_queue_path(prd_dir: &Path) -> PathBuf {
    prd_dir.join("update.json")
}

// --- Reads ---

/// Read the backlog index. Missing or unparseable files yield `None` so a
/// corrupted index cannot permanently jam the loop; the caller decides how
/// to surface the absence.
pub fn read_index(prd_dir: &Path) -> Option<BacklogIndex> {
    let contents = fs::read_to_string(index_path(prd_dir)).ok()?;
    match serde_json::from_str(&contents) {
        Ok(index) => Some(index),
        Err(e) => {
            log_warn!("Warning: Failed to parse index.json: {}", e);
            None
        }
    }
}

/// Read one story document. Missing or unparseable files yield `None`;
/// per-story corruption affects only that story.
pub fn read_story(prd_dir: &Path, id: &str) -> Option<Story> {
    let path = story_path(prd_dir, id);
    let contents = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(story) => Some(story),
        Err(e) => {
            log_warn!("Warning: Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

/// The story referenced by `index.next_story`, or `None`. Does not mutate
/// any state.
pub fn get_next_story(prd_dir: &Path) -> Option<Story> {
    let index = read_index(prd_dir)?;
    let id = index.next_story?;
    read_story(prd_dir, &id)
}

// --- Writes ---

/// Save the index using atomic write (temp file, sync, rename).
/// Whole-document serialization, pretty-printed with a trailing newline.
pub fn write_index(prd_dir: &Path, index: &BacklogIndex) -> Result<(), String> {
    write_json(&index_path(prd_dir), index)
}

/// Save one story document, creating `stories/` if needed.
pub fn write_story(prd_dir: &Path, story: &Story) -> Result<(), String> {
    write_json(&story_path(prd_dir, &story.id), story)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("Cannot determine parent directory of {}", path.display()))?;

    fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;

    let mut json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize {}: {}", path.display(), e))?;
    json.push('\n');

    let temp_file = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {}", parent.display(), e))?;

    fs::write(temp_file.path(), &json).map_err(|e| format!("Failed to write temp file: {}", e))?;

    // sync to disk before rename
    let file = fs::File::open(temp_file.path())
        .map_err(|e| format!("Failed to open temp file for sync: {}", e))?;
    file.sync_all()
        .map_err(|e| format!("Failed to sync temp file: {}", e))?;

    temp_file
        .persist(path)
        .map_err(|e| format!("Failed to rename temp file to {}: {}", path.display(), e))?;

    Ok(())
}

// --- Transitions ---

/// Mark a story complete and persist the transition.
///
/// Sets `passes`, `completed_at`, `completed_by` on the story, moves it
/// from pending to completed, then cascade-unblocks every blocked story
/// whose `blocked_by` names this id.
pub fn complete_story(prd_dir: &Path, id: &str, completed_by: &str) -> Result<(), String> {
    // Re-read the latest story state so assistant-side criterion edits
    // made during the iteration survive the whole-document rewrite.
    let mut story =
        read_story(prd_dir, id).ok_or_else(|| format!("Story {} not found in backlog", id))?;
    story.passes = true;
    story.completed_at = Some(chrono::Utc::now().to_rfc3339());
    story.completed_by = Some(completed_by.to_string());
    write_story(prd_dir, &story)?;

    let mut index = read_index(prd_dir)
        .ok_or_else(|| String::from(RalphError::IndexUnreadable(prd_dir.display().to_string())))?;

    index.pending.retain(|p| p != id);
    index.blocked.retain(|b| b != id);
    if !index.completed.iter().any(|c| c == id) {
        index.completed.push(id.to_string());
    }

    // Cascade auto-unblock: stories blocked on the one just completed
    // re-enter the tail of pending.
    let unblockable: Vec<String> = index
        .blocked
        .iter()
        .filter(|b| {
            read_story(prd_dir, b)
                .map(|s| s.blocked_by.as_deref() == Some(id))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    for b in &unblockable {
        if let Some(mut blocked_story) = read_story(prd_dir, b) {
            blocked_story.blocked_by = None;
            write_story(prd_dir, &blocked_story)?;
        }
        index.blocked.retain(|x| x != b);
        if !index.pending.iter().any(|p| p == b) {
            index.pending.push(b.clone());
        }
    }

    recompute_next(&mut index);
    write_index(prd_dir, &index)
}

/// Block a story with a reason and persist the transition.
pub fn block_story(prd_dir: &Path, id: &str, reason: &str) -> Result<(), String> {
    let mut story =
        read_story(prd_dir, id).ok_or_else(|| format!("Story {} not found in backlog", id))?;
    story.blocked_by = Some(reason.to_string());
    write_story(prd_dir, &story)?;

    let mut index = read_index(prd_dir)
        .ok_or_else(|| String::from(RalphError::IndexUnreadable(prd_dir.display().to_string())))?;

    index.pending.retain(|p| p != id);
    if !index.blocked.iter().any(|b| b == id) {
        index.blocked.push(id.to_string());
    }

    recompute_next(&mut index);
    write_index(prd_dir, &index)
}

/// Clear a story's blocker and return it to the tail of pending.
pub fn unblock_story(prd_dir: &Path, id: &str) -> Result<(), String> {
    let mut story =
        read_story(prd_dir, id).ok_or_else(|| format!("Story {} not found in backlog", id))?;
    story.blocked_by = None;
    write_story(prd_dir, &story)?;

    let mut index = read_index(prd_dir)
        .ok_or_else(|| String::from(RalphError::IndexUnreadable(prd_dir.display().to_string())))?;

    index.blocked.retain(|b| b != id);
    if !index.pending.iter().any(|p| p == id) {
        index.pending.push(id.to_string());
    }

    recompute_next(&mut index);
    write_index(prd_dir, &index)
}

/// Resolve the pathological state where a story carries `blocked_by` but is
/// still listed in pending. Called for the head story at every iteration
/// start.
pub fn auto_block_story_if_needed(prd_dir: &Path, id: &str) -> Result<AutoBlockResolution, String> {
    let story =
        read_story(prd_dir, id).ok_or_else(|| format!("Story {} not found in backlog", id))?;
    let blocker = story
        .blocked_by
        .clone()
        .ok_or_else(|| format!("Story {} has no blocker to resolve", id))?;

    let mut index = read_index(prd_dir)
        .ok_or_else(|| String::from(RalphError::IndexUnreadable(prd_dir.display().to_string())))?;

    if index.completed.iter().any(|c| *c == blocker) {
        // Blocker already done: clear the stale reference, keep scheduling.
        let mut story = story;
        story.blocked_by = None;
        write_story(prd_dir, &story)?;
        return Ok(AutoBlockResolution::Unblocked);
    }

    index.pending.retain(|p| p != id);
    if !index.blocked.iter().any(|b| b == id) {
        index.blocked.push(id.to_string());
    }
    recompute_next(&mut index);
    write_index(prd_dir, &index)?;

    Ok(AutoBlockResolution::Blocked)
}

// --- Update queue ---

/// Merge the update queue document into the backlog, then delete it.
///
/// Merge order is fixed: new stories, story updates, moves to pending,
/// moves to blocked, removals, order/pending overrides (union-append),
/// next-story recompute. A missing file means "no update". A file that
/// fails to parse is left in place and reported, and the iteration
/// continues as if no queue existed.
pub fn apply_update_queue(prd_dir: &Path) -> UpdateOutcome {
    let queue_path = update_queue_path(prd_dir);
    let contents = match fs::read_to_string(&queue_path) {
        Ok(c) => c,
        // Another agent may have won the read-then-delete race.
        Err(_) => return UpdateOutcome::none(),
    };

    let queue: UpdateQueue = match serde_json::from_str(&contents) {
        Ok(q) => q,
        Err(e) => {
            return UpdateOutcome {
                applied: false,
                changes: vec![format!("Error: failed to parse update.json: {}", e)],
            };
        }
    };

    let mut index = read_index(prd_dir).unwrap_or_default();
    let mut changes = Vec::new();

    // 1. New stories
    for story in &queue.new_stories {
        if story.id.is_empty() {
            changes.push("Error: skipped new story with empty id".to_string());
            continue;
        }
        if let Err(e) = write_story(prd_dir, story) {
            changes.push(format!("Error: failed to write story {}: {}", story.id, e));
            continue;
        }
        if !index.story_order.iter().any(|s| *s == story.id) {
            index.story_order.push(story.id.clone());
        }
        let known = index.pending.iter().any(|s| *s == story.id)
            || index.blocked.iter().any(|s| *s == story.id)
            || index.completed.iter().any(|s| *s == story.id);
        if !known {
            index.pending.push(story.id.clone());
        }
        changes.push(format!("Added story {}", story.id));
    }

    // 2. Story updates (shallow merge by id; missing stories skipped)
    for partial in &queue.update_stories {
        let Some(id) = partial.get("id").and_then(|v| v.as_str()) else {
            changes.push("Error: skipped story update without id".to_string());
            continue;
        };
        let path = story_path(prd_dir, id);
        let existing = fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok());
        let Some(mut existing) = existing else {
            changes.push(format!("Skipped update for missing story {}", id));
            continue;
        };
        if let (Some(target), Some(source)) = (existing.as_object_mut(), partial.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        match write_json(&path, &existing) {
            Ok(()) => changes.push(format!("Updated story {}", id)),
            Err(e) => changes.push(format!("Error: failed to update story {}: {}", id, e)),
        }
    }

    // 3. Moves to pending
    for id in &queue.move_to_pending {
        index.blocked.retain(|b| b != id);
        if !index.pending.iter().any(|p| p == id) {
            index.pending.push(id.clone());
        }
        if let Some(mut story) = read_story(prd_dir, id) {
            story.blocked_by = None;
            if let Err(e) = write_story(prd_dir, &story) {
                changes.push(format!("Error: failed to unblock story {}: {}", id, e));
                continue;
            }
        }
        changes.push(format!("Moved {} to pending", id));
    }

    // 4. Moves to blocked
    for (id, reason) in &queue.move_to_blocked {
        index.pending.retain(|p| p != id);
        if !index.blocked.iter().any(|b| b == id) {
            index.blocked.push(id.clone());
        }
        if let Some(mut story) = read_story(prd_dir, id) {
            story.blocked_by = Some(reason.clone());
            if let Err(e) = write_story(prd_dir, &story) {
                changes.push(format!("Error: failed to block story {}: {}", id, e));
                continue;
            }
        }
        changes.push(format!("Moved {} to blocked: {}", id, reason));
    }

    // 5. Removals
    for id in &queue.remove_stories {
        index.pending.retain(|p| p != id);
        index.blocked.retain(|b| b != id);
        index.completed.retain(|c| c != id);
        index.story_order.retain(|s| s != id);
        match fs::remove_file(story_path(prd_dir, id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                changes.push(format!("Error: failed to delete story {}: {}", id, e));
                continue;
            }
        }
        changes.push(format!("Removed story {}", id));
    }

    // 6. Order/pending overrides: union-append new ids, never delete
    for id in &queue.story_order {
        if !index.story_order.iter().any(|s| s == id) {
            index.story_order.push(id.clone());
            changes.push(format!("Appended {} to story order", id));
        }
    }
    for id in &queue.pending {
        if !index.pending.iter().any(|p| p == id) {
            index.pending.push(id.clone());
            changes.push(format!("Appended {} to pending", id));
        }
    }

    // 7. Recompute, persist, consume
    recompute_next(&mut index);
    if let Err(e) = write_index(prd_dir, &index) {
        return UpdateOutcome {
            applied: false,
            changes: vec![format!("Error: failed to write index: {}", e)],
        };
    }

    match fs::remove_file(&queue_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            log_warn!("Warning: Failed to delete update.json: {}", e);
        }
    }

    UpdateOutcome {
        applied: true,
        changes,
    }
}

// --- Derived queries ---

/// Count of checked criteria over total. Derived on demand, never persisted.
pub fn criteria_progress(story: &Story) -> (usize, usize) {
    let total = story.acceptance_criteria.len();
    let checked = story
        .acceptance_criteria
        .iter()
        .filter(|c| c.checked)
        .count();
    (checked, total)
}

/// True when every dependency of `story` has `passes = true`. Missing
/// dependency files count as unmet. Surfaced for callers; the scheduler
/// itself always takes `pending[0]`.
pub fn are_dependencies_satisfied(prd_dir: &Path, story: &Story) -> bool {
    story.dependencies.iter().all(|dep| {
        read_story(prd_dir, dep)
            .map(|s| s.passes)
            .unwrap_or(false)
    })
}

fn recompute_next(index: &mut BacklogIndex) {
    index.next_story = index.pending.first().cloned();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AcceptanceCriterion;

    fn make_story(id: &str) -> Story {
        Story {
            id: id.to_string(),
            title: format!("Test story {}", id),
            ..Default::default()
        }
    }

    #[test]
    fn criteria_progress_counts_checked() {
        let mut story = make_story("US-001");
        story.acceptance_criteria = vec![
            AcceptanceCriterion {
                text: "a".to_string(),
                checked: true,
            },
            AcceptanceCriterion {
                text: "b".to_string(),
                checked: false,
            },
            AcceptanceCriterion {
                text: "c".to_string(),
                checked: true,
            },
        ];
        assert_eq!(criteria_progress(&story), (2, 3));
    }

    #[test]
    fn criteria_progress_empty() {
        assert_eq!(criteria_progress(&make_story("US-001")), (0, 0));
    }

    #[test]
    fn recompute_next_tracks_head() {
        let mut index = BacklogIndex::default();
        recompute_next(&mut index);
        assert_eq!(index.next_story, None);

        index.pending = vec!["US-002".to_string(), "US-001".to_string()];
        recompute_next(&mut index);
        assert_eq!(index.next_story, Some("US-002".to_string()));
    }
}
