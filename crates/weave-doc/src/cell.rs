//! Cell model and per-cell execution state machine.
//!
//! A document is an ordered list of cells. Markdown cells are render-only
//! and immutable once parsed. Code cells carry execution state that is
//! mutated in place as kernel messages arrive, so that a re-parse of the
//! surrounding document does not lose accumulated output.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::render;

/// Stable, content-derived cell identity.
///
/// Computed from the cell's role and normalized source, so identical cells
/// produce the same id across re-parses and process restarts. Collisions are
/// an accepted design assumption, not a checked condition: the id is 64 bits
/// of a SHA-256 digest, which is unique for any practical document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Hashid(String);

impl Hashid {
    /// Derive the id for a cell from its role tag and normalized source.
    pub fn derive(role: &str, normalized: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(role.as_bytes());
        hasher.update(b"\0");
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();
        Hashid(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hashid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hashid {
    fn from(s: &str) -> Self {
        Hashid(s.to_string())
    }
}

/// Content type of a rendered output payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mime {
    Plain,
    Html,
    Markdown,
    Png,
}

impl Mime {
    pub fn from_media_type(s: &str) -> Option<Self> {
        match s {
            "text/plain" => Some(Mime::Plain),
            "text/html" => Some(Mime::Html),
            "text/markdown" => Some(Mime::Markdown),
            "image/png" => Some(Mime::Png),
            _ => None,
        }
    }

    pub fn as_media_type(&self) -> &'static str {
        match self {
            Mime::Plain => "text/plain",
            Mime::Html => "text/html",
            Mime::Markdown => "text/markdown",
            Mime::Png => "image/png",
        }
    }
}

/// Display modifier parsed from the fence line or toggled at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CellFlag {
    /// Collapse the cell's output in the rendered page.
    Hide,
}

impl CellFlag {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "hide" => Some(CellFlag::Hide),
            _ => None,
        }
    }

    pub fn as_class(&self) -> &'static str {
        match self {
            CellFlag::Hide => "hide",
        }
    }
}

/// Execution lifecycle of a code cell. Only moves forward; re-evaluation
/// goes through an explicit [`CodeCell::reset`] back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Pending,
    Evaluating,
    Done,
    Errored,
}

impl CellStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CellStatus::Done | CellStatus::Errored)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("invalid transition: {op} while {from:?}")]
    InvalidTransition { op: &'static str, from: CellStatus },
}

/// Render-only narrative cell. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct MarkdownCell {
    hashid: Hashid,
    html: String,
}

impl MarkdownCell {
    pub fn new(source: &str) -> Self {
        let normalized = normalize_source(source);
        MarkdownCell {
            hashid: Hashid::derive("markdown", &normalized),
            html: render::markdown_to_html(source),
        }
    }

    pub fn hashid(&self) -> &Hashid {
        &self.hashid
    }

    pub fn html(&self) -> String {
        format!(
            "<div class=\"{} markdown-cell\">\n{}</div><!--cell-->",
            self.hashid, self.html
        )
    }
}

/// Executable cell with tracked output and a single-fulfillment
/// completion signal.
#[derive(Debug)]
pub struct CodeCell {
    hashid: Hashid,
    code: String,
    flags: BTreeSet<CellFlag>,
    output: BTreeMap<Mime, String>,
    status: CellStatus,
    /// Fulfilled exactly once per generation; `reset` re-arms a fresh
    /// channel, which cancels waiters on the stale one.
    done: watch::Sender<bool>,
}

impl CodeCell {
    pub fn new(code: &str, flags: BTreeSet<CellFlag>) -> Self {
        let normalized = normalize_source(code);
        let (done, _) = watch::channel(false);
        CodeCell {
            hashid: Hashid::derive("code", &normalized),
            code: code.to_string(),
            flags,
            output: BTreeMap::new(),
            status: CellStatus::Pending,
            done,
        }
    }

    pub fn hashid(&self) -> &Hashid {
        &self.hashid
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn status(&self) -> CellStatus {
        self.status
    }

    pub fn flags(&self) -> &BTreeSet<CellFlag> {
        &self.flags
    }

    pub fn output(&self) -> &BTreeMap<Mime, String> {
        &self.output
    }

    /// Clear output, return to `Pending`, and re-arm the completion signal.
    /// Valid from any state; the step before re-submitting for execution.
    pub fn reset(&mut self) {
        self.output.clear();
        self.status = CellStatus::Pending;
        let (done, _) = watch::channel(false);
        self.done = done;
    }

    /// Enter `Evaluating`. Called when the cell is submitted (or optimistically
    /// when a new cell is queued for execution).
    pub fn set_evaluating(&mut self) -> Result<(), CellError> {
        match self.status {
            CellStatus::Pending => {
                self.status = CellStatus::Evaluating;
                Ok(())
            }
            from => Err(CellError::InvalidTransition {
                op: "set_evaluating",
                from,
            }),
        }
    }

    /// Append streamed text to the plain-text output. Valid only while
    /// `Evaluating`; does not change status.
    pub fn append_stream(&mut self, text: &str) -> Result<(), CellError> {
        if self.status != CellStatus::Evaluating {
            return Err(CellError::InvalidTransition {
                op: "append_stream",
                from: self.status,
            });
        }
        self.output.entry(Mime::Plain).or_default().push_str(text);
        Ok(())
    }

    /// Replace the output mapping wholesale with a fresh result.
    pub fn set_output(&mut self, output: BTreeMap<Mime, String>) -> Result<(), CellError> {
        if self.status != CellStatus::Evaluating {
            return Err(CellError::InvalidTransition {
                op: "set_output",
                from: self.status,
            });
        }
        self.output = output;
        Ok(())
    }

    /// Transition to `Done` and fulfill the completion signal.
    pub fn set_done(&mut self) -> Result<(), CellError> {
        if self.status != CellStatus::Evaluating {
            return Err(CellError::InvalidTransition {
                op: "set_done",
                from: self.status,
            });
        }
        self.status = CellStatus::Done;
        // send_replace latches the value even when nobody subscribed yet;
        // a later wait_for must still observe the completion.
        self.done.send_replace(true);
        Ok(())
    }

    /// Store a rendered traceback as the output, transition to `Errored`,
    /// and fulfill the completion signal. Both execute-reply errors and
    /// out-of-band kernel errors funnel here.
    pub fn set_error(&mut self, traceback_html: String) -> Result<(), CellError> {
        if self.status.is_terminal() {
            return Err(CellError::InvalidTransition {
                op: "set_error",
                from: self.status,
            });
        }
        self.output = BTreeMap::from([(Mime::Html, traceback_html)]);
        self.status = CellStatus::Errored;
        self.done.send_replace(true);
        Ok(())
    }

    /// Suspend until the completion signal is fulfilled. Any number of
    /// callers may wait; a `reset` cancels waiters on the old generation by
    /// dropping its sender.
    pub fn wait_for(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.done.subscribe();
        async move {
            let _ = rx.wait_for(|fulfilled| *fulfilled).await;
        }
    }

    /// Inject previously persisted state scraped from a report. Bypasses the
    /// normal message-driven transitions: this is state restoration at
    /// startup, not an execution result.
    pub fn restore(&mut self, output_html: String, done: bool) {
        self.output.insert(Mime::Html, output_html);
        if done {
            self.status = CellStatus::Done;
            self.done.send_replace(true);
        }
    }

    pub fn add_flag(&mut self, flag: CellFlag) {
        self.flags.insert(flag);
    }

    /// Adopt the flags of a freshly parsed twin. Returns whether anything
    /// changed (a flag edit re-renders the cell but never re-executes it,
    /// since the code is identical by construction of the hash).
    pub fn update_flags(&mut self, flags: &BTreeSet<CellFlag>) -> bool {
        if &self.flags == flags {
            false
        } else {
            self.flags = flags.clone();
            true
        }
    }

    /// The HTML fragment for this cell: a div class-tagged with the hashid,
    /// status, and flags, holding the code and an `output` sub-element.
    /// Recomputed from current state on every call.
    pub fn html(&self) -> String {
        let mut classes = format!("{} code-cell", self.hashid);
        match self.status {
            CellStatus::Evaluating => classes.push_str(" evaluating"),
            CellStatus::Done => classes.push_str(" done"),
            CellStatus::Errored => classes.push_str(" error"),
            CellStatus::Pending => {}
        }
        for flag in &self.flags {
            classes.push(' ');
            classes.push_str(flag.as_class());
        }
        // The <!--output--> sentinel closes the output element unambiguously
        // for the resume scrape, even when the output itself nests divs.
        format!(
            "<div class=\"{}\">\n<pre class=\"code\">{}</pre>\n<div class=\"output\">{}</div><!--output-->\n</div><!--cell-->",
            classes,
            render::escape_html(&self.code),
            self.output_html(),
        )
    }

    /// The richest available rendering of the current output.
    fn output_html(&self) -> String {
        if let Some(html) = self.output.get(&Mime::Html) {
            html.clone()
        } else if let Some(png) = self.output.get(&Mime::Png) {
            format!("<img src=\"data:image/png;base64,{}\">", png.trim())
        } else if let Some(md) = self.output.get(&Mime::Markdown) {
            render::markdown_to_html(md)
        } else if let Some(text) = self.output.get(&Mime::Plain) {
            format!("<pre>{}</pre>", render::escape_html(text))
        } else {
            String::new()
        }
    }
}

/// A unit of the document.
#[derive(Debug)]
pub enum Cell {
    Markdown(MarkdownCell),
    Code(CodeCell),
}

impl Cell {
    pub fn hashid(&self) -> &Hashid {
        match self {
            Cell::Markdown(cell) => cell.hashid(),
            Cell::Code(cell) => cell.hashid(),
        }
    }

    pub fn html(&self) -> String {
        match self {
            Cell::Markdown(cell) => cell.html(),
            Cell::Code(cell) => cell.html(),
        }
    }

    pub fn as_code(&self) -> Option<&CodeCell> {
        match self {
            Cell::Code(cell) => Some(cell),
            Cell::Markdown(_) => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut CodeCell> {
        match self {
            Cell::Code(cell) => Some(cell),
            Cell::Markdown(_) => None,
        }
    }
}

/// Normalize source before hashing: strip trailing whitespace per line and
/// trailing blank lines, so incidental whitespace does not change identity.
pub fn normalize_source(source: &str) -> String {
    let mut normalized: String = source
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    while normalized.ends_with('\n') {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_cell(code: &str) -> CodeCell {
        CodeCell::new(code, BTreeSet::new())
    }

    #[test]
    fn test_hashid_is_deterministic() {
        let a = code_cell("print(1)");
        let b = code_cell("print(1)");
        assert_eq!(a.hashid(), b.hashid());
    }

    #[test]
    fn test_hashid_changes_with_code() {
        let a = code_cell("print(1)");
        let b = code_cell("print(2)");
        assert_ne!(a.hashid(), b.hashid());
    }

    #[test]
    fn test_hashid_distinguishes_roles() {
        let code = code_cell("hello");
        let markdown = MarkdownCell::new("hello");
        assert_ne!(code.hashid(), markdown.hashid());
    }

    #[test]
    fn test_hashid_ignores_trailing_whitespace() {
        let a = code_cell("print(1)  \n\n");
        let b = code_cell("print(1)");
        assert_eq!(a.hashid(), b.hashid());
    }

    #[test]
    fn test_flags_do_not_change_identity() {
        let a = CodeCell::new("print(1)", BTreeSet::new());
        let b = CodeCell::new("print(1)", BTreeSet::from([CellFlag::Hide]));
        assert_eq!(a.hashid(), b.hashid());
    }

    #[test]
    fn test_status_moves_forward_through_done() {
        let mut cell = code_cell("1 + 1");
        assert_eq!(cell.status(), CellStatus::Pending);
        cell.set_evaluating().unwrap();
        assert_eq!(cell.status(), CellStatus::Evaluating);
        cell.set_done().unwrap();
        assert_eq!(cell.status(), CellStatus::Done);
    }

    #[test]
    fn test_set_done_requires_evaluating() {
        let mut cell = code_cell("1 + 1");
        assert!(cell.set_done().is_err());
    }

    #[test]
    fn test_append_stream_requires_evaluating() {
        let mut cell = code_cell("print(1)");
        assert!(cell.append_stream("1\n").is_err());
    }

    #[test]
    fn test_append_stream_accumulates() {
        let mut cell = code_cell("print(1)");
        cell.set_evaluating().unwrap();
        cell.append_stream("a").unwrap();
        cell.append_stream("b").unwrap();
        assert_eq!(cell.output().get(&Mime::Plain).unwrap(), "ab");
        assert_eq!(cell.status(), CellStatus::Evaluating);
    }

    #[test]
    fn test_set_output_replaces_wholesale() {
        let mut cell = code_cell("x");
        cell.set_evaluating().unwrap();
        cell.set_output(BTreeMap::from([(Mime::Plain, "old".to_string())]))
            .unwrap();
        cell.set_output(BTreeMap::from([(Mime::Html, "<b>new</b>".to_string())]))
            .unwrap();
        assert!(cell.output().get(&Mime::Plain).is_none());
        assert_eq!(cell.output().get(&Mime::Html).unwrap(), "<b>new</b>");
    }

    #[test]
    fn test_set_error_is_terminal() {
        let mut cell = code_cell("1/0");
        cell.set_evaluating().unwrap();
        cell.set_error("<pre class=\"traceback\">boom</pre>".to_string())
            .unwrap();
        assert_eq!(cell.status(), CellStatus::Errored);
        assert!(cell.set_error("again".to_string()).is_err());
    }

    #[test]
    fn test_reset_returns_to_pending_and_clears_output() {
        let mut cell = code_cell("print(1)");
        cell.set_evaluating().unwrap();
        cell.append_stream("1\n").unwrap();
        cell.set_done().unwrap();
        cell.reset();
        assert_eq!(cell.status(), CellStatus::Pending);
        assert!(cell.output().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_done() {
        let mut cell = code_cell("1 + 1");
        cell.set_evaluating().unwrap();
        let wait = cell.wait_for();
        cell.set_done().unwrap();
        wait.await;
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_error() {
        let mut cell = code_cell("1/0");
        cell.set_evaluating().unwrap();
        let wait = cell.wait_for();
        cell.set_error("boom".to_string()).unwrap();
        wait.await;
    }

    #[tokio::test]
    async fn test_wait_for_supports_multiple_waiters() {
        let mut cell = code_cell("1 + 1");
        cell.set_evaluating().unwrap();
        let first = cell.wait_for();
        let second = cell.wait_for();
        cell.set_done().unwrap();
        first.await;
        second.await;
    }

    #[tokio::test]
    async fn test_reset_cancels_stale_waiters() {
        let mut cell = code_cell("1 + 1");
        cell.set_evaluating().unwrap();
        let stale = cell.wait_for();
        cell.reset();
        // Old generation's sender is dropped, so the waiter resolves
        // instead of hanging forever.
        stale.await;
    }

    #[tokio::test]
    async fn test_wait_for_after_reset_uses_new_signal() {
        let mut cell = code_cell("1 + 1");
        cell.set_evaluating().unwrap();
        cell.set_done().unwrap();
        cell.reset();
        cell.set_evaluating().unwrap();
        let wait = cell.wait_for();
        cell.set_done().unwrap();
        wait.await;
    }

    #[tokio::test]
    async fn test_wait_for_subscribed_after_done_resolves() {
        let mut cell = code_cell("1 + 1");
        cell.set_evaluating().unwrap();
        cell.set_done().unwrap();
        // Completion happened with no subscriber; the signal must have
        // latched anyway.
        tokio::time::timeout(std::time::Duration::from_secs(2), cell.wait_for())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_subscribed_after_error_resolves() {
        let mut cell = code_cell("1/0");
        cell.set_evaluating().unwrap();
        cell.set_error("boom".to_string()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), cell.wait_for())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_after_restore_resolves() {
        let mut cell = code_cell("print(1)");
        cell.restore("<pre>1</pre>".to_string(), true);
        tokio::time::timeout(std::time::Duration::from_secs(2), cell.wait_for())
            .await
            .unwrap();
    }

    #[test]
    fn test_restore_marks_done_without_execution() {
        let mut cell = code_cell("print(1)");
        cell.restore("<pre>1</pre>".to_string(), true);
        assert_eq!(cell.status(), CellStatus::Done);
        assert_eq!(cell.output().get(&Mime::Html).unwrap(), "<pre>1</pre>");
    }

    #[test]
    fn test_update_flags_reports_change() {
        let mut cell = code_cell("print(1)");
        let hidden = BTreeSet::from([CellFlag::Hide]);
        assert!(cell.update_flags(&hidden));
        assert!(!cell.update_flags(&hidden));
        assert!(cell.update_flags(&BTreeSet::new()));
    }

    #[test]
    fn test_html_carries_hashid_and_status_classes() {
        let mut cell = CodeCell::new("print(1)", BTreeSet::from([CellFlag::Hide]));
        cell.set_evaluating().unwrap();
        cell.set_done().unwrap();
        let html = cell.html();
        assert!(html.starts_with(&format!("<div class=\"{} code-cell done hide\">", cell.hashid())));
        assert!(html.contains("<div class=\"output\">"));
        assert!(html.ends_with("</div><!--cell-->"));
    }

    #[test]
    fn test_html_escapes_code() {
        let cell = code_cell("x < 1 & y > 2");
        assert!(cell.html().contains("x &lt; 1 &amp; y &gt; 2"));
    }

    #[test]
    fn test_html_prefers_rich_output() {
        let mut cell = code_cell("x");
        cell.set_evaluating().unwrap();
        cell.set_output(BTreeMap::from([
            (Mime::Plain, "plain".to_string()),
            (Mime::Html, "<table></table>".to_string()),
        ]))
        .unwrap();
        let html = cell.html();
        assert!(html.contains("<div class=\"output\"><table></table></div>"));
    }

    #[test]
    fn test_html_renders_png_as_data_uri() {
        let mut cell = code_cell("plot()");
        cell.set_evaluating().unwrap();
        cell.set_output(BTreeMap::from([(Mime::Png, "aGVsbG8=\n".to_string())]))
            .unwrap();
        assert!(cell
            .html()
            .contains("<img src=\"data:image/png;base64,aGVsbG8=\">"));
    }

    #[test]
    fn test_markdown_cell_html_is_class_tagged() {
        let cell = MarkdownCell::new("# Title");
        let html = cell.html();
        assert!(html.contains(&format!("class=\"{} markdown-cell\"", cell.hashid())));
        assert!(html.contains("<h1>Title</h1>"));
    }

    #[test]
    fn test_mime_media_type_round_trip() {
        for mime in [Mime::Plain, Mime::Html, Mime::Markdown, Mime::Png] {
            assert_eq!(Mime::from_media_type(mime.as_media_type()), Some(mime));
        }
        assert_eq!(Mime::from_media_type("application/x-unknown"), None);
    }
}
