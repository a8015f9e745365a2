use std::time::{Duration, Instant};

use tempfile::TempDir;

use ralph::pipeline::{
    contains_escapes, strip_escapes, AnsiStripper, EventBatcher, EventKind, LogWriter,
};

// =============================================================================
// Escape stripping
// =============================================================================

#[test]
fn strips_csi_sequences() {
    assert_eq!(strip_escapes("\x1b[31mred\x1b[0m"), "red");
    assert_eq!(strip_escapes("\x1b[2J\x1b[1;1Hcleared"), "cleared");
    // Private-mode CSI with intermediates
    assert_eq!(strip_escapes("\x1b[?25lhidden\x1b[?25h"), "hidden");
}

#[test]
fn strips_osc_sequences_bel_terminated() {
    assert_eq!(strip_escapes("\x1b]0;window title\x07text"), "text");
}

#[test]
fn strips_osc_sequences_st_terminated() {
    assert_eq!(strip_escapes("\x1b]8;;http://x\x1b\\link"), "link");
}

#[test]
fn strips_dcs_pm_apc_sequences() {
    assert_eq!(strip_escapes("\x1bPdevice control\x1b\\after"), "after");
    assert_eq!(strip_escapes("\x1bXprivacy\x1b\\after"), "after");
    assert_eq!(strip_escapes("\x1b^pm\x1b\\after"), "after");
    assert_eq!(strip_escapes("\x1b_apc\x1b\\after"), "after");
}

#[test]
fn strips_single_char_escapes() {
    assert_eq!(strip_escapes("\x1bMreverse"), "reverse");
    assert_eq!(strip_escapes("a\x1b7b\x1b8c"), "abc");
}

#[test]
fn stripping_is_idempotent() {
    let inputs = [
        "\x1b[31mred\x1b[0m plain",
        "\x1b]0;title\x07body",
        "\x1bPstuff\x1b\\tail",
        "mixed \x1b[1mbold\x1b[22m and \x1b]8;;u\x1b\\text",
        "no escapes at all",
    ];
    for input in inputs {
        let once = strip_escapes(input);
        let twice = strip_escapes(&once);
        assert_eq!(once, twice, "strip must be idempotent for {:?}", input);
        assert!(
            !once.contains('\x1b'),
            "stripped output must contain no ESC bytes"
        );
    }
}

#[test]
fn sequences_split_across_chunks() {
    let mut stripper = AnsiStripper::new();
    let mut out = Vec::new();
    // "\x1b[31mred" split mid-sequence
    out.extend(stripper.feed(b"\x1b["));
    out.extend(stripper.feed(b"31"));
    out.extend(stripper.feed(b"mred"));
    assert_eq!(out, b"red");
}

#[test]
fn osc_with_embedded_escape_restarting_sequence() {
    // ESC inside an OSC that is not ST: the new escape takes over
    let stripped = strip_escapes("\x1b]0;title\x1b[31mx");
    assert!(!stripped.contains('\x1b'));
}

#[test]
fn detects_escape_bytes() {
    assert!(contains_escapes(b"\x1b[0m"));
    assert!(!contains_escapes(b"plain text"));
}

// =============================================================================
// Event batching
// =============================================================================

#[test]
fn batcher_flushes_on_newline_threshold() {
    let mut batcher = EventBatcher::new();
    let now = Instant::now();

    let chunk = "line\n".repeat(49);
    assert!(batcher.push_data(&chunk, now).is_none());

    let event = batcher.push_data("one more\n", now).unwrap();
    assert_eq!(event.kind, EventKind::Data);
    assert_eq!(event.data.matches('\n').count(), 50);
}

#[test]
fn batcher_flushes_on_elapsed_time() {
    let mut batcher = EventBatcher::new();
    let start = Instant::now();

    assert!(batcher.push_data("partial", start).is_none());
    let later = start + Duration::from_millis(150);
    let event = batcher.push_data(" more", later).unwrap();
    assert_eq!(event.data, "partial more");
}

#[test]
fn batcher_poll_flushes_aged_data() {
    let mut batcher = EventBatcher::new();
    let start = Instant::now();

    assert!(batcher.push_data("quiet stream", start).is_none());
    assert!(batcher.poll(start + Duration::from_millis(50)).is_none());
    let event = batcher.poll(start + Duration::from_millis(120)).unwrap();
    assert_eq!(event.data, "quiet stream");
}

#[test]
fn batcher_non_data_event_flushes_pending_first() {
    let mut batcher = EventBatcher::new();
    let now = Instant::now();

    batcher.push_data("pending bytes", now);
    let events = batcher.push_event(EventKind::Exit, "0");

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Data);
    assert_eq!(events[0].data, "pending bytes");
    assert_eq!(events[1].kind, EventKind::Exit);
    assert_eq!(events[1].data, "0");
}

#[test]
fn batcher_non_data_event_alone_when_nothing_pending() {
    let mut batcher = EventBatcher::new();
    let events = batcher.push_event(EventKind::Error, "boom");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Error);
}

#[test]
fn batcher_marks_escape_bearing_batches() {
    let mut batcher = EventBatcher::new();
    let start = Instant::now();

    batcher.push_data("\x1b[31m", start);
    let event = batcher
        .push_data("red", start + Duration::from_millis(150))
        .unwrap();
    assert!(event.has_escapes);

    batcher.push_data("plain", start);
    let event = batcher
        .push_data(" text", start + Duration::from_millis(300))
        .unwrap();
    assert!(!event.has_escapes);
}

// =============================================================================
// Log writer
// =============================================================================

#[test]
fn log_writer_flushes_on_item_threshold() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");
    let mut writer = LogWriter::new(&path);
    let now = Instant::now();

    for i in 0..99 {
        writer.push(format!("line {}\n", i), now);
    }
    assert!(!path.exists(), "buffer under threshold must not hit disk");

    writer.push("line 99\n".to_string(), now);
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 100);
}

#[test]
fn log_writer_flushes_on_age() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");
    let mut writer = LogWriter::new(&path);
    let start = Instant::now();

    writer.push("early\n".to_string(), start);
    writer.push("late\n".to_string(), start + Duration::from_millis(1100));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("early"));
    assert!(contents.contains("late"));
}

#[test]
fn log_writer_drains_on_drop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");

    {
        let mut writer = LogWriter::new(&path);
        writer.push("buffered but never flushed\n".to_string(), Instant::now());
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("buffered but never flushed"));
}

#[test]
fn log_writer_appends_across_flushes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.log");
    let mut writer = LogWriter::new(&path);

    writer.push("first\n".to_string(), Instant::now());
    writer.flush();
    writer.push("second\n".to_string(), Instant::now());
    writer.flush();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "first\nsecond\n");
}
