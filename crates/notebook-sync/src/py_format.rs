//! Percent-delimited `.py` notebook text, the on-disk form notebooks take on
//! the server.
//!
//! ```text
//! # %%
//! x = 1
//! # %% [markdown]
//! # Heading
//! ```
//!
//! A line is a delimiter when, after leading whitespace, it starts with
//! `# %` or `## %`. Delimiters mentioning "markdown" open a markdown cell,
//! everything else a code cell. Empty cells are not emitted.

use crate::cell::{Cell, CellType};
use crate::notebook::NotebookDocument;

const DELIMITER_PREFIXES: [&str; 2] = ["# %", "## %"];

fn is_delimiter(line: &str) -> bool {
    let line = line.trim_start();
    DELIMITER_PREFIXES.iter().any(|p| line.starts_with(p))
}

fn delimiter_type(line: &str) -> CellType {
    if line.to_lowercase().contains("markdown") {
        CellType::Markdown
    } else {
        CellType::Code
    }
}

/// Parse percent-format text into a notebook document.
pub fn parse(text: &str) -> NotebookDocument {
    let mut cells = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut cell_type = CellType::Code;

    let mut flush = |cell_type: CellType, lines: &mut Vec<String>| {
        if !lines.is_empty() {
            cells.push(Cell {
                cell_type,
                source: std::mem::take(lines),
                outputs: Vec::new(),
            });
        }
    };

    for line in text.split_inclusive('\n') {
        if is_delimiter(line) {
            flush(cell_type, &mut lines);
            cell_type = delimiter_type(line);
            continue;
        }
        lines.push(line.to_string());
    }
    flush(cell_type, &mut lines);

    NotebookDocument::new(cells)
}

/// Render cells as percent-format text. Outputs are not written.
pub fn render(cells: &[Cell]) -> String {
    let mut out = String::new();
    for (i, cell) in cells.iter().enumerate() {
        out.push_str(match cell.cell_type {
            CellType::Markdown => "# %% [markdown]\n",
            CellType::Code => "# %%\n",
        });
        for line in &cell.source {
            out.push_str(line);
        }
        if i + 1 != cells.len() && !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
