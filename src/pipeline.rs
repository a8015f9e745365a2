use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::log_warn;

/// Flush a display batch once this many newlines have accumulated.
const FLUSH_NEWLINE_THRESHOLD: usize = 50;

/// Flush a display batch after this much time with pending data.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Flush the log buffer once this many items have accumulated.
const LOG_BUFFER_ITEMS: usize = 100;

/// Flush the log buffer after this much time with pending items.
const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// --- Escape stripping ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StripState {
    Ground,
    Escape,
    Csi,
    Osc,
    OscEscape,
    /// Covers DCS, PM, and APC -- all terminated by ST (`ESC \`).
    Dcs,
    DcsEscape,
}

/// Incremental escape-sequence stripper.
///
/// A small state machine rather than a mega-regex so OSC/DCS variants and
/// sequences split across chunk boundaries are handled uniformly. Handles
/// CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL` or `ESC ] ... ESC \`),
/// DCS/PM/APC (`ESC P|X|^|_ ... ESC \`), and single-char escapes.
pub struct AnsiStripper {
    state: StripState,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            state: StripState::Ground,
        }
    }

    /// Feed a chunk; returns the printable bytes with escape sequences
    /// removed. State persists across calls so sequences may span chunks.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len());
        for &b in bytes {
            self.step(b, &mut out);
        }
        out
    }

    fn step(&mut self, b: u8, out: &mut Vec<u8>) {
        match self.state {
            StripState::Ground => {
                if b == ESC {
                    self.state = StripState::Escape;
                } else {
                    out.push(b);
                }
            }
            StripState::Escape => {
                self.state = match b {
                    b'[' => StripState::Csi,
                    b']' => StripState::Osc,
                    b'P' | b'X' | b'^' | b'_' => StripState::Dcs,
                    // Single-char escape: consume the char and return.
                    _ => StripState::Ground,
                };
            }
            StripState::Csi => {
                // Parameter, intermediate, then one final byte in 0x40..=0x7e.
                if (0x40..=0x7e).contains(&b) {
                    self.state = StripState::Ground;
                }
            }
            StripState::Osc => {
                if b == BEL {
                    self.state = StripState::Ground;
                } else if b == ESC {
                    self.state = StripState::OscEscape;
                }
            }
            StripState::OscEscape => {
                if b == b'\\' {
                    self.state = StripState::Ground;
                } else {
                    // Not a string terminator; the ESC starts a fresh
                    // sequence. Re-handle this byte in the Escape state.
                    self.state = StripState::Escape;
                    self.step(b, out);
                }
            }
            StripState::Dcs => {
                if b == ESC {
                    self.state = StripState::DcsEscape;
                }
            }
            StripState::DcsEscape => {
                if b == b'\\' {
                    self.state = StripState::Ground;
                } else {
                    self.state = StripState::Dcs;
                }
            }
        }
    }
}

/// Strip escape sequences from a complete text. Idempotent: the output
/// contains no ESC bytes.
pub fn strip_escapes(text: &str) -> String {
    let mut stripper = AnsiStripper::new();
    String::from_utf8_lossy(&stripper.feed(text.as_bytes())).into_owned()
}

/// True when the chunk contains any escape byte.
pub fn contains_escapes(bytes: &[u8]) -> bool {
    bytes.contains(&ESC)
}

// --- Event batching ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Data,
    Exit,
    Error,
}

/// One batched UI-facing event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub kind: EventKind,
    pub timestamp: String,
    pub data: String,
    pub has_escapes: bool,
}

/// Converts bursty subprocess output into bounded batches for UI
/// consumption. Flushes when accumulated data holds enough newlines, when
/// the pending batch is old enough, or when a non-data event arrives.
pub struct EventBatcher {
    buffer: String,
    newline_count: usize,
    has_escapes: bool,
    first_pending: Option<Instant>,
}

impl Default for EventBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBatcher {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            newline_count: 0,
            has_escapes: false,
            first_pending: None,
        }
    }

    /// Accumulate a data chunk. Returns a batch when a flush threshold is
    /// crossed.
    pub fn push_data(&mut self, data: &str, now: Instant) -> Option<OutputEvent> {
        if self.first_pending.is_none() {
            self.first_pending = Some(now);
        }
        self.newline_count += data.bytes().filter(|b| *b == b'\n').count();
        self.has_escapes |= contains_escapes(data.as_bytes());
        self.buffer.push_str(data);

        let elapsed = self
            .first_pending
            .map(|t| now.duration_since(t))
            .unwrap_or_default();
        if self.newline_count >= FLUSH_NEWLINE_THRESHOLD || elapsed >= FLUSH_INTERVAL {
            return self.take_batch(EventKind::Data);
        }
        None
    }

    /// Timer-driven flush check for quiet streams.
    pub fn poll(&mut self, now: Instant) -> Option<OutputEvent> {
        match self.first_pending {
            Some(t) if now.duration_since(t) >= FLUSH_INTERVAL => self.take_batch(EventKind::Data),
            _ => None,
        }
    }

    /// A non-data event (`exit`, `error`) flushes any pending data batch
    /// first, then emits the event itself.
    pub fn push_event(&mut self, kind: EventKind, data: &str) -> Vec<OutputEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some(batch) = self.take_batch(EventKind::Data) {
            events.push(batch);
        }
        events.push(OutputEvent {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data: data.to_string(),
            has_escapes: false,
        });
        events
    }

    fn take_batch(&mut self, kind: EventKind) -> Option<OutputEvent> {
        if self.buffer.is_empty() {
            self.first_pending = None;
            self.newline_count = 0;
            return None;
        }
        let data = std::mem::take(&mut self.buffer);
        let has_escapes = self.has_escapes;
        self.newline_count = 0;
        self.has_escapes = false;
        self.first_pending = None;
        Some(OutputEvent {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
            has_escapes,
        })
    }
}

// --- Log writing ---

/// Buffered append-only writer for the per-run log file. Single writer;
/// receives escape-stripped payloads only.
pub struct LogWriter {
    path: PathBuf,
    buffer: Vec<String>,
    first_pending: Option<Instant>,
}

impl LogWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            buffer: Vec::new(),
            first_pending: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one stripped payload, flushing when the buffer fills or ages
    /// out.
    pub fn push(&mut self, item: String, now: Instant) {
        if self.first_pending.is_none() {
            self.first_pending = Some(now);
        }
        self.buffer.push(item);

        let elapsed = self
            .first_pending
            .map(|t| now.duration_since(t))
            .unwrap_or_default();
        if self.buffer.len() >= LOG_BUFFER_ITEMS || elapsed >= LOG_FLUSH_INTERVAL {
            self.flush();
        }
    }

    /// Write all buffered items to the log file. Called on exit to drain.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            self.first_pending = None;
            return;
        }
        let items = std::mem::take(&mut self.buffer);
        self.first_pending = None;

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                log_warn!(
                    "Warning: Failed to open log file {}: {}",
                    self.path.display(),
                    e
                );
                return;
            }
        };
        for item in items {
            if let Err(e) = file.write_all(item.as_bytes()) {
                log_warn!(
                    "Warning: Failed to write log file {}: {}",
                    self.path.display(),
                    e
                );
                return;
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

// --- Dual-stream fork ---

/// Callback receiving UI-facing batches with escape sequences preserved.
pub type DisplaySink = Box<dyn FnMut(&OutputEvent) + Send>;

/// Forks every subprocess chunk into a display stream (raw, batched) and a
/// file stream (escape-stripped, buffered). The two streams are strictly
/// separate; consumers never see each other's data.
pub struct OutputPipeline {
    batcher: EventBatcher,
    stripper: AnsiStripper,
    log: LogWriter,
    display: DisplaySink,
}

impl OutputPipeline {
    pub fn new(log_path: &Path, display: DisplaySink) -> Self {
        Self {
            batcher: EventBatcher::new(),
            stripper: AnsiStripper::new(),
            log: LogWriter::new(log_path),
            display,
        }
    }

    /// Handle one raw chunk from the pty.
    pub fn handle_chunk(&mut self, bytes: &[u8]) {
        let now = Instant::now();

        let raw = String::from_utf8_lossy(bytes);
        if let Some(event) = self.batcher.push_data(&raw, now) {
            (self.display)(&event);
        }

        let stripped = self.stripper.feed(bytes);
        if !stripped.is_empty() {
            self.log
                .push(String::from_utf8_lossy(&stripped).into_owned(), now);
        }
    }

    /// Flush any aged-out display batch.
    pub fn tick(&mut self) {
        if let Some(event) = self.batcher.poll(Instant::now()) {
            (self.display)(&event);
        }
    }

    /// Flush both streams on subprocess exit or error.
    pub fn finish(&mut self, kind: EventKind, data: &str) {
        for event in self.batcher.push_event(kind, data) {
            (self.display)(&event);
        }
        self.log.flush();
    }
}
