//! Decoder for the marker-delimited console protocol.
//!
//! The in-environment script prints its git artifacts between fixed marker
//! lines. Decoding is a single pass over the lines driven by an explicit
//! transition table: `transition(section, marker)` either names the next
//! section plus an effect, or declines, in which case the line is captured as
//! ordinary content of the current section.
//!
//! The parser never fails. Missing sections decode as empty, unknown lines
//! outside a section are dropped, and a file record left open at the end of
//! input is still emitted.

use crate::core::types::{FileChange, ParsedResult};

pub const COMMIT_HASH_PREFIX: &str = "COMMIT_HASH=";
pub const PATCH_START: &str = "=== PATCH START ===";
pub const PATCH_END: &str = "=== PATCH END ===";
pub const DIFF_START: &str = "=== GIT DIFF START ===";
pub const DIFF_END: &str = "=== GIT DIFF END ===";
pub const CHANGED_FILES_START: &str = "=== CHANGED FILES START ===";
pub const CHANGED_FILES_END: &str = "=== CHANGED FILES END ===";
pub const FILE_CHANGES_START: &str = "=== FILE CHANGES START ===";
pub const FILE_CHANGES_END: &str = "=== FILE CHANGES END ===";
pub const FILE_PREFIX: &str = "FILE: ";
pub const BEFORE_START: &str = "=== BEFORE START ===";
pub const BEFORE_END: &str = "=== BEFORE END ===";
pub const AFTER_START: &str = "=== AFTER START ===";
pub const AFTER_END: &str = "=== AFTER END ===";
pub const FILE_END: &str = "=== FILE END ===";

/// Before-block sentinel for a file created by the agent.
pub const FILE_NOT_EXISTS: &str = "FILE_NOT_EXISTS";
/// After-block sentinel for a file deleted by the agent.
pub const FILE_DELETED: &str = "FILE_DELETED";

/// A recognised protocol line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    CommitHash(&'a str),
    PatchStart,
    PatchEnd,
    DiffStart,
    DiffEnd,
    ChangedFilesStart,
    ChangedFilesEnd,
    FileChangesStart,
    FileChangesEnd,
    File(&'a str),
    BeforeStart,
    BeforeEnd,
    AfterStart,
    AfterEnd,
    FileEnd,
}

impl<'a> Marker<'a> {
    /// Classify a single line (without its newline). Trailing `\r` is ignored.
    pub fn classify(line: &'a str) -> Option<Self> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(hash) = line.strip_prefix(COMMIT_HASH_PREFIX) {
            return Some(Marker::CommitHash(hash.trim()));
        }
        if let Some(path) = line.strip_prefix(FILE_PREFIX) {
            return Some(Marker::File(path));
        }
        let marker = match line {
            PATCH_START => Marker::PatchStart,
            PATCH_END => Marker::PatchEnd,
            DIFF_START => Marker::DiffStart,
            DIFF_END => Marker::DiffEnd,
            CHANGED_FILES_START => Marker::ChangedFilesStart,
            CHANGED_FILES_END => Marker::ChangedFilesEnd,
            FILE_CHANGES_START => Marker::FileChangesStart,
            FILE_CHANGES_END => Marker::FileChangesEnd,
            BEFORE_START => Marker::BeforeStart,
            BEFORE_END => Marker::BeforeEnd,
            AFTER_START => Marker::AfterStart,
            AFTER_END => Marker::AfterEnd,
            FILE_END => Marker::FileEnd,
            _ => return None,
        };
        Some(marker)
    }
}

/// Which part of a file record is being captured inside the file-changes section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Idle,
    Before,
    After,
}

/// Section currently being captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    None,
    Patch,
    Diff,
    ChangedFiles,
    FileChanges(Capture),
}

/// Side effect attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect<'a> {
    Nothing,
    SetCommitHash(&'a str),
    /// Emit the in-progress file record (if any) and open a new one.
    BeginFile(&'a str),
    /// Emit the in-progress file record (if any).
    FlushFile,
    /// Reset the current file's before buffer.
    OpenBefore,
    /// Reset the current file's after buffer.
    OpenAfter,
}

/// The transition table.
///
/// Returns `None` when `marker` carries no meaning in `section`; the caller
/// then treats the line as content. Inside a before/after block only markers
/// that close the block are honoured, so file content is captured verbatim.
pub fn transition<'a>(section: Section, marker: Marker<'a>) -> Option<(Section, Effect<'a>)> {
    use Capture::{After, Before, Idle};

    let next = match (section, marker) {
        // Inside a before/after block only the closing markers are honoured.
        (Section::FileChanges(Before), Marker::BeforeEnd) => {
            (Section::FileChanges(Idle), Effect::Nothing)
        }
        (Section::FileChanges(After), Marker::AfterEnd) => {
            (Section::FileChanges(Idle), Effect::Nothing)
        }
        (Section::FileChanges(Before | After), Marker::FileChangesEnd) => {
            (Section::None, Effect::FlushFile)
        }
        (Section::FileChanges(Before | After), _) => return None,

        (s, Marker::CommitHash(hash)) => (s, Effect::SetCommitHash(hash)),

        // Opening a section implicitly closes the current one, which tolerates
        // a missing end marker.
        (Section::FileChanges(Idle), Marker::PatchStart) => (Section::Patch, Effect::FlushFile),
        (Section::FileChanges(Idle), Marker::DiffStart) => (Section::Diff, Effect::FlushFile),
        (Section::FileChanges(Idle), Marker::ChangedFilesStart) => {
            (Section::ChangedFiles, Effect::FlushFile)
        }
        (Section::FileChanges(Idle), Marker::FileChangesStart) => {
            (Section::FileChanges(Idle), Effect::FlushFile)
        }
        (_, Marker::PatchStart) => (Section::Patch, Effect::Nothing),
        (_, Marker::DiffStart) => (Section::Diff, Effect::Nothing),
        (_, Marker::ChangedFilesStart) => (Section::ChangedFiles, Effect::Nothing),
        (_, Marker::FileChangesStart) => (Section::FileChanges(Idle), Effect::Nothing),

        (Section::Patch, Marker::PatchEnd) => (Section::None, Effect::Nothing),
        (Section::Diff, Marker::DiffEnd) => (Section::None, Effect::Nothing),
        (Section::ChangedFiles, Marker::ChangedFilesEnd) => (Section::None, Effect::Nothing),

        (Section::FileChanges(Idle), Marker::FileChangesEnd) => (Section::None, Effect::FlushFile),
        (Section::FileChanges(Idle), Marker::File(path)) => {
            (Section::FileChanges(Idle), Effect::BeginFile(path))
        }
        (Section::FileChanges(Idle), Marker::BeforeStart) => {
            (Section::FileChanges(Before), Effect::OpenBefore)
        }
        (Section::FileChanges(Idle), Marker::AfterStart) => {
            (Section::FileChanges(After), Effect::OpenAfter)
        }
        (Section::FileChanges(Idle), Marker::FileEnd | Marker::BeforeEnd | Marker::AfterEnd) => {
            (Section::FileChanges(Idle), Effect::Nothing)
        }

        // Stray markers outside any section are dropped.
        (Section::None, _) => (Section::None, Effect::Nothing),
        _ => return None,
    };
    Some(next)
}

/// File record being accumulated inside the file-changes section.
#[derive(Debug, Default)]
struct PendingFile {
    filename: String,
    before: Option<Vec<String>>,
    after: Option<Vec<String>>,
}

impl PendingFile {
    fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            ..Self::default()
        }
    }

    fn finish(self) -> FileChange {
        FileChange {
            filename: self.filename,
            before: join_block(self.before, FILE_NOT_EXISTS),
            after: join_block(self.after, FILE_DELETED),
        }
    }
}

fn join_block(lines: Option<Vec<String>>, sentinel: &str) -> Option<String> {
    let content = lines?.join("\n");
    if content == sentinel {
        return None;
    }
    Some(content)
}

/// Transient parser state for one `parse` call.
#[derive(Debug)]
struct ParseState {
    section: Section,
    current: Option<PendingFile>,
    result: ParsedResult,
    patch: Vec<String>,
    diff: Vec<String>,
}

impl ParseState {
    fn new() -> Self {
        Self {
            section: Section::None,
            current: None,
            result: ParsedResult::default(),
            patch: Vec::new(),
            diff: Vec::new(),
        }
    }

    fn feed(&mut self, line: &str) {
        if let Some(marker) = Marker::classify(line)
            && let Some((next, effect)) = transition(self.section, marker)
        {
            self.apply(effect);
            self.section = next;
            return;
        }
        self.capture(line);
    }

    fn apply(&mut self, effect: Effect<'_>) {
        match effect {
            Effect::Nothing => {}
            Effect::SetCommitHash(hash) => {
                self.result.commit_hash = (!hash.is_empty()).then(|| hash.to_string());
            }
            Effect::BeginFile(path) => {
                self.flush_file();
                self.current = Some(PendingFile::new(path));
            }
            Effect::FlushFile => self.flush_file(),
            Effect::OpenBefore => {
                if let Some(file) = self.current.as_mut() {
                    file.before = Some(Vec::new());
                }
            }
            Effect::OpenAfter => {
                if let Some(file) = self.current.as_mut() {
                    file.after = Some(Vec::new());
                }
            }
        }
    }

    fn capture(&mut self, line: &str) {
        match self.section {
            Section::None | Section::FileChanges(Capture::Idle) => {}
            Section::Patch => self.patch.push(line.to_string()),
            Section::Diff => self.diff.push(line.to_string()),
            Section::ChangedFiles => {
                let path = line.trim();
                if !path.is_empty() {
                    self.result.changed_files.push(path.to_string());
                }
            }
            Section::FileChanges(Capture::Before) => {
                if let Some(buf) = self.current.as_mut().and_then(|f| f.before.as_mut()) {
                    buf.push(line.to_string());
                }
            }
            Section::FileChanges(Capture::After) => {
                if let Some(buf) = self.current.as_mut().and_then(|f| f.after.as_mut()) {
                    buf.push(line.to_string());
                }
            }
        }
    }

    fn flush_file(&mut self) {
        if let Some(file) = self.current.take() {
            self.result.file_changes.push(file.finish());
        }
    }

    fn finish(mut self) -> ParsedResult {
        self.flush_file();
        self.result.git_patch = self.patch.join("\n");
        self.result.git_diff = self.diff.join("\n");
        self.result
    }
}

/// Decode console output into structured git artifacts. Never fails.
pub fn parse(console_output: &str) -> ParsedResult {
    let mut state = ParseState::new();
    for line in console_output.split('\n') {
        state.feed(line);
    }
    state.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ConsoleBuilder;

    #[test]
    fn decodes_full_marker_sequence() {
        let output = ConsoleBuilder::new()
            .line("Cloning into '/workspace/repo'...")
            .commit_hash("0123abcd")
            .patch("From 0123abcd\nSubject: [PATCH] Claude: add files")
            .diff("diff --git a/a.txt b/a.txt\n+hello")
            .changed_files(&["a.txt", "b.txt"])
            .file_changes(&[
                ("a.txt", None, Some("hello")),
                ("b.txt", Some("old"), None),
            ])
            .line("Environment work completed successfully")
            .build();

        let parsed = parse(&output);
        assert_eq!(parsed.commit_hash.as_deref(), Some("0123abcd"));
        assert_eq!(
            parsed.git_patch,
            "From 0123abcd\nSubject: [PATCH] Claude: add files"
        );
        assert_eq!(parsed.git_diff, "diff --git a/a.txt b/a.txt\n+hello");
        assert_eq!(parsed.changed_files, vec!["a.txt", "b.txt"]);
        assert_eq!(
            parsed.file_changes,
            vec![
                FileChange {
                    filename: "a.txt".to_string(),
                    before: None,
                    after: Some("hello".to_string()),
                },
                FileChange {
                    filename: "b.txt".to_string(),
                    before: Some("old".to_string()),
                    after: None,
                },
            ]
        );
    }

    #[test]
    fn empty_sections_decode_as_noop() {
        let output = ConsoleBuilder::new().empty_sections().commit_hash("").build();
        let parsed = parse(&output);
        assert_eq!(parsed, ParsedResult::default());
        assert!(parsed.is_noop());
    }

    #[test]
    fn missing_sections_decode_as_empty() {
        let parsed = parse("just some agent chatter\nno markers at all\n");
        assert_eq!(parsed, ParsedResult::default());
    }

    #[test]
    fn multi_line_file_content_is_preserved() {
        let output = ConsoleBuilder::new()
            .file_changes(&[("src/lib.rs", Some("fn a() {}\n\nfn b() {}"), Some("fn a() {}"))])
            .build();
        let parsed = parse(&output);
        assert_eq!(
            parsed.file_changes[0].before.as_deref(),
            Some("fn a() {}\n\nfn b() {}")
        );
    }

    #[test]
    fn marker_lookalikes_inside_file_content_are_content() {
        let output = [
            FILE_CHANGES_START,
            "FILE: notes.md",
            BEFORE_START,
            "COMMIT_HASH=not-a-hash",
            PATCH_START,
            BEFORE_END,
            AFTER_START,
            "new",
            AFTER_END,
            FILE_END,
            FILE_CHANGES_END,
        ]
        .join("\n");
        let parsed = parse(&output);
        assert_eq!(parsed.commit_hash, None);
        assert_eq!(parsed.git_patch, "");
        assert_eq!(
            parsed.file_changes[0].before.as_deref(),
            Some("COMMIT_HASH=not-a-hash\n=== PATCH START ===")
        );
    }

    #[test]
    fn truncated_file_changes_still_emit_last_file() {
        let output = [
            FILE_CHANGES_START,
            "FILE: a.txt",
            BEFORE_START,
            FILE_NOT_EXISTS,
            BEFORE_END,
            AFTER_START,
            "partial",
        ]
        .join("\n");
        let parsed = parse(&output);
        assert_eq!(
            parsed.file_changes,
            vec![FileChange {
                filename: "a.txt".to_string(),
                before: None,
                after: Some("partial".to_string()),
            }]
        );
    }

    #[test]
    fn file_content_is_line_based_not_byte_exact() {
        // The script terminates unterminated files with a newline, so `hello`
        // and `hello\n` both reach the console as the single line `hello`.
        let output = [
            FILE_CHANGES_START,
            "FILE: greeting.txt",
            BEFORE_START,
            FILE_NOT_EXISTS,
            BEFORE_END,
            AFTER_START,
            "hello",
            AFTER_END,
            FILE_END,
            FILE_CHANGES_END,
        ]
        .join("\n");
        let parsed = parse(&output);
        assert_eq!(parsed.file_changes[0].after.as_deref(), Some("hello"));
        // A real file holding only the sentinel is indistinguishable from a
        // missing one.
        assert_eq!(parsed.file_changes[0].before, None);
    }

    #[test]
    fn missing_end_marker_is_closed_by_next_section() {
        let output = [PATCH_START, "patch line", DIFF_START, "diff line", DIFF_END].join("\n");
        let parsed = parse(&output);
        assert_eq!(parsed.git_patch, "patch line");
        assert_eq!(parsed.git_diff, "diff line");
    }

    #[test]
    fn crlf_markers_are_recognised() {
        let output = "COMMIT_HASH=abc\r\n=== CHANGED FILES START ===\r\nx.txt\r\n=== CHANGED FILES END ===\r\n";
        let parsed = parse(output);
        assert_eq!(parsed.commit_hash.as_deref(), Some("abc"));
        assert_eq!(parsed.changed_files, vec!["x.txt"]);
    }

    #[test]
    fn table_ignores_stray_end_markers_outside_sections() {
        assert_eq!(
            transition(Section::None, Marker::PatchEnd),
            Some((Section::None, Effect::Nothing))
        );
        assert_eq!(
            transition(Section::FileChanges(Capture::Before), Marker::DiffStart),
            None
        );
        assert_eq!(
            transition(Section::FileChanges(Capture::After), Marker::File("x")),
            None
        );
        assert_eq!(
            transition(Section::FileChanges(Capture::Idle), Marker::File("x")),
            Some((Section::FileChanges(Capture::Idle), Effect::BeginFile("x")))
        );
    }
}
