//! Source document splitter.
//!
//! A weave source is markdown text; fenced blocks whose info string names
//! the configured kernel language become code cells. Tokens after the
//! language on the fence line are display flags, e.g. ```` ```python hide ````.
//! Everything else stays narrative markdown. Parsing is deterministic: the
//! same text always yields the same cells and hashids.

use std::collections::BTreeSet;

use crate::cell::{Cell, CellFlag, CodeCell, MarkdownCell, normalize_source};

#[derive(Debug, Clone)]
pub struct Parser {
    language: String,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new("python")
    }
}

impl Parser {
    pub fn new(language: &str) -> Self {
        Parser {
            language: language.to_string(),
        }
    }

    /// Split source text into an ordered cell list.
    pub fn parse(&self, text: &str) -> Vec<Cell> {
        let mut cells = Vec::new();
        let mut markdown: Vec<&str> = Vec::new();
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            match self.fence_flags(line) {
                Some(flags) => {
                    Self::flush_markdown(&mut markdown, &mut cells);
                    let mut code_lines: Vec<&str> = Vec::new();
                    // An unterminated fence runs to end of input.
                    for code_line in lines.by_ref() {
                        if code_line.trim() == "```" {
                            break;
                        }
                        code_lines.push(code_line);
                    }
                    let code = code_lines.join("\n");
                    cells.push(Cell::Code(CodeCell::new(&code, flags)));
                }
                None => markdown.push(line),
            }
        }
        Self::flush_markdown(&mut markdown, &mut cells);
        cells
    }

    /// If the line opens a code fence for our language, return its flags.
    fn fence_flags(&self, line: &str) -> Option<BTreeSet<CellFlag>> {
        let info = line.strip_prefix("```")?;
        let mut tokens = info.split_whitespace();
        if tokens.next()? != self.language {
            return None;
        }
        Some(tokens.filter_map(CellFlag::from_token).collect())
    }

    fn flush_markdown(markdown: &mut Vec<&str>, cells: &mut Vec<Cell>) {
        let source = markdown.join("\n");
        markdown.clear();
        if !normalize_source(&source).is_empty() {
            cells.push(Cell::Markdown(MarkdownCell::new(&source)));
        }
    }
}
