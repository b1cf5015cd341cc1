//! Report persistence: the rendered HTML page is the only persisted artifact.
//!
//! Writing serializes the whole document into the report file with an atomic
//! replace, so a concurrent reader never observes a partial write. Resuming
//! scrapes a previously written report for cell fragments by their hashid
//! class and injects output and Done status back into matching freshly
//! parsed cells, which lets a restarted run skip re-executing anything whose
//! source did not change.

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::cell::Cell;
use crate::document::Document;

const TEMPLATE: &str = include_str!("../templates/report.html");
const CELLS_PLACEHOLDER: &str = "__CELLS__";

/// Matches one persisted code-cell fragment: hashid class, remaining class
/// tokens, and the inner HTML of its `output` element. Only ever applied to
/// our own writer's markup; the `<!--output-->` and `<!--cell-->` sentinels
/// delimit the capture even when the output HTML nests closing divs.
fn cell_fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<div class="([0-9a-f]{16}) code-cell([^"]*)">.*?<div class="output">(.*?)</div><!--output-->\s*</div><!--cell-->"#,
        )
        .expect("cell fragment regex is valid")
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("writing report: {0}")]
    Io(#[from] std::io::Error),
    #[error("replacing report: {0}")]
    Replace(#[from] tempfile::PersistError),
}

/// The full page with the given cell HTML substituted into the template.
pub fn page(cells_html: &str) -> String {
    TEMPLATE.replace(CELLS_PLACEHOLDER, cells_html)
}

/// The template split at the cell placeholder, for batch mode's
/// front / per-cell / back streaming writes.
pub fn page_parts() -> (&'static str, &'static str) {
    TEMPLATE
        .split_once(CELLS_PLACEHOLDER)
        .expect("template contains the cells placeholder")
}

/// Overwrite the report with the document's current state.
///
/// Writes to a temp file in the report's directory and renames it into
/// place, so the report always reflects one consistent snapshot.
pub fn write_report(path: &Path, doc: &Document) -> Result<(), ReportError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(page(&doc.full_html()).as_bytes())?;
    tmp.persist(path)?;
    Ok(())
}

/// Inject persisted output and status from a prior report into freshly
/// parsed cells. Returns how many cells were restored. Fragments with no
/// matching hashid in the parse are discarded; markdown cells carry no
/// execution state and are never touched.
pub fn resume(cells: &mut [Cell], report_html: &str) -> usize {
    let mut restored = 0;
    for captures in cell_fragment_re().captures_iter(report_html) {
        let hashid = &captures[1];
        let classes: Vec<&str> = captures[2].split_whitespace().collect();
        let output_html = captures[3].trim().to_string();

        let Some(cell) = cells
            .iter_mut()
            .find(|cell| cell.hashid().as_str() == hashid)
            .and_then(Cell::as_code_mut)
        else {
            log::debug!("[report] Discarding stale fragment {}", hashid);
            continue;
        };
        cell.restore(output_html, classes.contains(&"done"));
        if classes.contains(&"hide") {
            cell.add_flag(crate::cell::CellFlag::Hide);
        }
        restored += 1;
    }
    restored
}
