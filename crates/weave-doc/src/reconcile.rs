//! Diff a freshly parsed cell list against the live document.
//!
//! Identity is solely the content hash: a cell that moved but kept its text
//! keeps its object and execution state; a cell whose code changed by one
//! character is a new cell and re-executes from scratch. Flag-only changes
//! update the stored cell in place and re-render without re-executing.

use crate::cell::{Cell, CellStatus, Hashid};
use crate::document::Document;

/// What a reconciliation pass decided.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Ids inserted by this pass, in document order.
    pub new_cells: Vec<Hashid>,
    /// Existing cells whose flags changed (re-render only).
    pub updated: Vec<Hashid>,
    /// Code to submit to the kernel, in document order.
    pub plan: Vec<(Hashid, String)>,
}

impl Outcome {
    /// Ids whose HTML must be re-broadcast: new cells plus flag updates.
    /// Unchanged cells are deliberately absent; clients must not assume a
    /// broadcast carries the whole document.
    pub fn changed(&self) -> impl Iterator<Item = &Hashid> {
        self.new_cells.iter().chain(self.updated.iter())
    }
}

/// Merge `parsed` into `doc`, preserving state for unchanged identities.
///
/// New code cells are optimistically flagged Evaluating and planned for
/// execution, except cells already restored to Done from a prior report.
/// The render order is replaced wholesale; cells absent from the new parse
/// are dropped.
pub fn reconcile(doc: &mut Document, parsed: Vec<Cell>) -> Outcome {
    let mut outcome = Outcome::default();
    let order: Vec<Hashid> = parsed.iter().map(|cell| cell.hashid().clone()).collect();

    for cell in parsed {
        let hashid = cell.hashid().clone();
        if doc.contains(&hashid) {
            if let Some(parsed_code) = cell.as_code() {
                let flags = parsed_code.flags().clone();
                if let Some(stored) = doc.code_cell_mut(&hashid) {
                    if stored.update_flags(&flags) {
                        outcome.updated.push(hashid);
                    }
                }
            }
        } else {
            if let Cell::Code(code_cell) = &cell {
                if code_cell.status() != CellStatus::Done {
                    outcome
                        .plan
                        .push((hashid.clone(), code_cell.code().to_string()));
                }
            }
            outcome.new_cells.push(hashid);
            doc.upsert(cell);
        }
    }

    // Flag planned cells as evaluating before anything is submitted, so the
    // first broadcast already shows them busy. The reset wipes any output a
    // resume scrape injected into an unfinished cell; left in place it would
    // shadow the fresh run's streamed output.
    for (hashid, _) in &outcome.plan {
        if let Some(cell) = doc.code_cell_mut(hashid) {
            cell.reset();
            let _ = cell.set_evaluating();
        }
    }

    doc.set_order(order);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Mime;
    use crate::parser::Parser;
    use std::collections::BTreeMap;

    const DOC: &str = "\
# Intro

```python
a = 1
```

```python
b = 2
```
";

    fn load(doc: &mut Document, text: &str) -> Outcome {
        reconcile(doc, Parser::default().parse(text))
    }

    #[test]
    fn test_initial_load_plans_all_code_cells() {
        let mut doc = Document::new();
        let outcome = load(&mut doc, DOC);
        assert_eq!(outcome.new_cells.len(), 3);
        assert_eq!(outcome.plan.len(), 2);
        assert_eq!(outcome.plan[0].1, "a = 1");
        assert_eq!(outcome.plan[1].1, "b = 2");
    }

    #[test]
    fn test_planned_cells_are_marked_evaluating() {
        let mut doc = Document::new();
        let outcome = load(&mut doc, DOC);
        for (hashid, _) in &outcome.plan {
            let cell = doc.get(hashid).unwrap().as_code().unwrap();
            assert_eq!(cell.status(), CellStatus::Evaluating);
        }
    }

    #[test]
    fn test_identical_reparse_triggers_nothing() {
        let mut doc = Document::new();
        load(&mut doc, DOC);
        let outcome = load(&mut doc, DOC);
        assert!(outcome.new_cells.is_empty());
        assert!(outcome.updated.is_empty());
        assert!(outcome.plan.is_empty());
    }

    #[test]
    fn test_single_cell_edit_replans_only_that_cell() {
        let mut doc = Document::new();
        let before = load(&mut doc, DOC);
        let unchanged_id = before.plan[1].0.clone();

        // Give the untouched cell some state to survive the edit.
        let cell = doc.code_cell_mut(&unchanged_id).unwrap();
        cell.set_output(BTreeMap::from([(Mime::Plain, "2".to_string())]))
            .unwrap();
        cell.set_done().unwrap();

        let edited = DOC.replace("a = 1", "a = 10");
        let outcome = load(&mut doc, edited.as_str());
        assert_eq!(outcome.new_cells.len(), 1);
        assert_eq!(outcome.plan.len(), 1);
        assert_eq!(outcome.plan[0].1, "a = 10");

        let survivor = doc.get(&unchanged_id).unwrap().as_code().unwrap();
        assert_eq!(survivor.status(), CellStatus::Done);
        assert_eq!(survivor.output().get(&Mime::Plain).unwrap(), "2");
    }

    #[test]
    fn test_changed_lists_only_new_and_updated() {
        let mut doc = Document::new();
        load(&mut doc, DOC);
        let edited = DOC.replace("a = 1", "a = 10");
        let outcome = load(&mut doc, edited.as_str());
        let changed: Vec<_> = outcome.changed().collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0], &outcome.new_cells[0]);
    }

    #[test]
    fn test_flag_edit_updates_without_replanning() {
        let mut doc = Document::new();
        load(&mut doc, DOC);
        let flagged = DOC.replace("```python\na = 1", "```python hide\na = 1");
        let outcome = load(&mut doc, flagged.as_str());
        assert!(outcome.new_cells.is_empty());
        assert!(outcome.plan.is_empty());
        assert_eq!(outcome.updated.len(), 1);
        let cell = doc.get(&outcome.updated[0]).unwrap().as_code().unwrap();
        assert!(cell.html().contains(" hide"));
    }

    #[test]
    fn test_moved_cell_keeps_state() {
        let mut doc = Document::new();
        let outcome = load(&mut doc, DOC);
        let first_id = outcome.plan[0].0.clone();
        let cell = doc.code_cell_mut(&first_id).unwrap();
        cell.set_done().unwrap();

        let reordered = "\
# Intro

```python
b = 2
```

```python
a = 1
```
";
        let outcome = load(&mut doc, reordered);
        assert!(outcome.plan.is_empty());
        assert_eq!(
            doc.get(&first_id).unwrap().as_code().unwrap().status(),
            CellStatus::Done
        );
        assert_eq!(doc.order().last(), Some(&first_id));
    }

    #[test]
    fn test_deleted_cells_leave_the_order() {
        let mut doc = Document::new();
        load(&mut doc, DOC);
        let outcome = load(&mut doc, "# Intro\n\n```python\na = 1\n```\n");
        assert!(outcome.new_cells.is_empty());
        assert_eq!(doc.order().len(), 2);
    }

    #[test]
    fn test_replanned_resumed_cell_starts_clean() {
        let mut doc = Document::new();
        let mut parsed = Parser::default().parse(DOC);
        // An unfinished fragment from a previous run injected partial output.
        parsed[1]
            .as_code_mut()
            .unwrap()
            .restore("<pre>old stale value</pre>".to_string(), false);
        let outcome = reconcile(&mut doc, parsed);
        assert_eq!(outcome.plan.len(), 2);

        let cell = doc.code_cell_mut(&outcome.plan[0].0).unwrap();
        assert!(cell.output().is_empty());
        cell.append_stream("new value").unwrap();
        cell.set_done().unwrap();
        let html = cell.html();
        assert!(html.contains("new value"));
        assert!(!html.contains("old stale value"));
    }

    #[test]
    fn test_restored_done_cells_are_not_planned() {
        let mut doc = Document::new();
        let mut parsed = Parser::default().parse(DOC);
        parsed[1]
            .as_code_mut()
            .unwrap()
            .restore("<pre>1</pre>".to_string(), true);
        let outcome = reconcile(&mut doc, parsed);
        assert_eq!(outcome.new_cells.len(), 3);
        assert_eq!(outcome.plan.len(), 1);
        assert_eq!(outcome.plan[0].1, "b = 2");
    }
}
