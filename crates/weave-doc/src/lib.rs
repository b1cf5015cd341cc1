//! weave-doc - document model and reconciliation core for weave.
//!
//! This crate is the pure half of the tool: splitting literate source text
//! into cells, assigning content-derived identity, tracking each code cell's
//! execution lifecycle, diffing fresh parses against the live document, and
//! persisting/resuming state through the rendered HTML report. It does not
//! talk to a kernel or a network; `weave` wires it to both.

pub mod cell;
pub mod document;
pub mod parser;
pub mod reconcile;
pub mod render;
pub mod report;

pub use cell::{Cell, CellError, CellFlag, CellStatus, CodeCell, Hashid, MarkdownCell, Mime};
pub use document::Document;
pub use parser::Parser;
pub use reconcile::{reconcile, Outcome};
