//! The live document: render order plus a content-addressed cell table.
//!
//! Order and the table are tracked separately because a re-parse may
//! reorder, insert, or delete cells while the table keeps existing cell
//! objects (and their execution state) alive by identity.

use std::collections::HashMap;

use crate::cell::{Cell, CodeCell, Hashid};

#[derive(Debug, Default)]
pub struct Document {
    order: Vec<Hashid>,
    cells: HashMap<Hashid, Cell>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    pub fn get(&self, hashid: &Hashid) -> Option<&Cell> {
        self.cells.get(hashid)
    }

    pub fn get_mut(&mut self, hashid: &Hashid) -> Option<&mut Cell> {
        self.cells.get_mut(hashid)
    }

    pub fn code_cell_mut(&mut self, hashid: &Hashid) -> Option<&mut CodeCell> {
        self.cells.get_mut(hashid).and_then(Cell::as_code_mut)
    }

    pub fn contains(&self, hashid: &Hashid) -> bool {
        self.cells.contains_key(hashid)
    }

    /// Insert a cell, replacing any previous cell with the same id.
    pub fn upsert(&mut self, cell: Cell) {
        self.cells.insert(cell.hashid().clone(), cell);
    }

    /// Replace the render order wholesale and drop cells whose id no longer
    /// appears in it.
    pub fn set_order(&mut self, order: Vec<Hashid>) {
        self.cells.retain(|hashid, _| order.contains(hashid));
        self.order = order;
    }

    pub fn order(&self) -> &[Hashid] {
        &self.order
    }

    pub fn cells_in_order(&self) -> impl Iterator<Item = &Cell> {
        self.order.iter().filter_map(|hashid| self.cells.get(hashid))
    }

    /// A consistent view of the current order and per-cell HTML.
    pub fn snapshot(&self) -> Vec<(Hashid, String)> {
        self.cells_in_order()
            .map(|cell| (cell.hashid().clone(), cell.html()))
            .collect()
    }

    /// The concatenated HTML of every cell in render order.
    pub fn full_html(&self) -> String {
        self.cells_in_order()
            .map(|cell| cell.html())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::MarkdownCell;
    use std::collections::BTreeSet;

    fn code(code: &str) -> Cell {
        Cell::Code(CodeCell::new(code, BTreeSet::new()))
    }

    #[test]
    fn test_get_missing_is_none() {
        let doc = Document::new();
        assert!(doc.get(&Hashid::from("0000000000000000")).is_none());
    }

    #[test]
    fn test_upsert_and_get() {
        let mut doc = Document::new();
        let cell = code("print(1)");
        let hashid = cell.hashid().clone();
        doc.upsert(cell);
        assert!(doc.contains(&hashid));
        assert!(doc.get(&hashid).unwrap().as_code().is_some());
    }

    #[test]
    fn test_set_order_drops_vanished_cells() {
        let mut doc = Document::new();
        let keep = code("print(1)");
        let drop = code("print(2)");
        let keep_id = keep.hashid().clone();
        let drop_id = drop.hashid().clone();
        doc.upsert(keep);
        doc.upsert(drop);
        doc.set_order(vec![keep_id.clone()]);
        assert!(doc.contains(&keep_id));
        assert!(!doc.contains(&drop_id));
    }

    #[test]
    fn test_snapshot_follows_order() {
        let mut doc = Document::new();
        let first = Cell::Markdown(MarkdownCell::new("# one"));
        let second = code("print(2)");
        let first_id = first.hashid().clone();
        let second_id = second.hashid().clone();
        doc.upsert(first);
        doc.upsert(second);
        doc.set_order(vec![second_id.clone(), first_id.clone()]);
        let snapshot = doc.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, second_id);
        assert_eq!(snapshot[1].0, first_id);
    }

    #[test]
    fn test_full_html_joins_cells() {
        let mut doc = Document::new();
        let cell = code("print(1)");
        let hashid = cell.hashid().clone();
        doc.upsert(cell);
        doc.set_order(vec![hashid.clone()]);
        assert!(doc.full_html().contains(hashid.as_str()));
    }
}
