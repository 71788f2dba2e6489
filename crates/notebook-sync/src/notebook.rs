//! The in-memory cell store and the ephemeral execution state that sits next
//! to it.
//!
//! Every operation is addressed by position. Out-of-range indices are no-ops:
//! callers race with server-driven reordering and the last mutation wins.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cell::{Cell, CellType, Output};

/// Wholesale notebook document, as exchanged with the server on open/save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookDocument {
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
    #[serde(default = "default_nbformat")]
    pub nbformat: u32,
    #[serde(default = "default_nbformat_minor")]
    pub nbformat_minor: u32,
}

fn empty_metadata() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_nbformat() -> u32 {
    4
}

fn default_nbformat_minor() -> u32 {
    4
}

impl NotebookDocument {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            metadata: empty_metadata(),
            nbformat: default_nbformat(),
            nbformat_minor: default_nbformat_minor(),
        }
    }
}

/// Fields merged into a cell by [`Notebook::update_cell`]. `None` leaves the
/// field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_type: Option<CellType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Output>>,
}

impl CellPatch {
    pub fn source(text: impl Into<String>) -> Self {
        Self {
            source: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn cell_type(cell_type: CellType) -> Self {
        Self {
            cell_type: Some(cell_type),
            ..Default::default()
        }
    }
}

/// Ordered cell list with a revision counter that moves on every effective
/// mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notebook {
    cells: Vec<Cell>,
    metadata: Value,
    revision: u64,
}

impl Notebook {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self {
            cells,
            metadata: empty_metadata(),
            revision: 0,
        }
    }

    pub fn from_document(doc: NotebookDocument) -> Self {
        Self {
            cells: doc.cells,
            metadata: doc.metadata,
            revision: 0,
        }
    }

    /// Snapshot for persistence. Metadata received on open is sent back as-is.
    pub fn to_document(&self) -> NotebookDocument {
        NotebookDocument {
            cells: self.cells.clone(),
            metadata: self.metadata.clone(),
            nbformat: default_nbformat(),
            nbformat_minor: default_nbformat_minor(),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    // ── User-facing mutations ───────────────────────────────────────

    /// Append a fresh empty code cell. Returns its index.
    pub fn add_cell(&mut self) -> usize {
        self.cells.push(Cell::empty_code());
        self.touch();
        self.cells.len() - 1
    }

    /// Shallow-merge `patch` into the cell at `index`.
    pub fn update_cell(&mut self, index: usize, patch: CellPatch) -> bool {
        let Some(cell) = self.cells.get_mut(index) else {
            return false;
        };
        if let Some(cell_type) = patch.cell_type {
            cell.cell_type = cell_type;
        }
        if let Some(source) = patch.source {
            cell.set_source_text(&source);
        }
        if let Some(outputs) = patch.outputs {
            cell.outputs = outputs;
        }
        self.touch();
        true
    }

    pub fn delete_cell(&mut self, index: usize) -> Option<Cell> {
        if index >= self.cells.len() {
            return None;
        }
        let removed = self.cells.remove(index);
        self.touch();
        Some(removed)
    }

    /// Swap with the previous cell. No-op at index 0.
    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.cells.len() {
            return false;
        }
        self.cells.swap(index - 1, index);
        self.touch();
        true
    }

    /// Swap with the next cell. No-op at the last index.
    pub fn move_down(&mut self, index: usize) -> bool {
        if index >= self.cells.len() || index + 1 == self.cells.len() {
            return false;
        }
        self.cells.swap(index, index + 1);
        self.touch();
        true
    }

    // ── Server-driven mutations ─────────────────────────────────────

    /// Insert `cell` at `index`, clamped to the end of the list.
    pub fn insert_cell(&mut self, index: usize, cell: Cell) -> usize {
        let index = index.min(self.cells.len());
        self.cells.insert(index, cell);
        self.touch();
        index
    }

    /// Remove from `from`, then insert at `to` (clamped to the shortened
    /// list). Cells between the two positions shift by one.
    pub fn move_cell(&mut self, from: usize, to: usize) -> bool {
        if from >= self.cells.len() {
            return false;
        }
        let cell = self.cells.remove(from);
        let to = to.min(self.cells.len());
        self.cells.insert(to, cell);
        self.touch();
        true
    }

    pub fn set_source(&mut self, index: usize, content: &str) -> bool {
        self.update_cell(index, CellPatch::source(content))
    }

    pub fn set_cell_type(&mut self, index: usize, cell_type: CellType) -> bool {
        self.update_cell(index, CellPatch::cell_type(cell_type))
    }

    // ── Outputs ─────────────────────────────────────────────────────

    pub fn clear_outputs(&mut self, index: usize) -> bool {
        self.update_cell(
            index,
            CellPatch {
                outputs: Some(Vec::new()),
                ..Default::default()
            },
        )
    }

    pub fn replace_outputs(&mut self, index: usize, outputs: Vec<Output>) -> bool {
        self.update_cell(
            index,
            CellPatch {
                outputs: Some(outputs),
                ..Default::default()
            },
        )
    }

    pub fn push_output(&mut self, index: usize, output: Output) -> bool {
        let Some(cell) = self.cells.get_mut(index) else {
            return false;
        };
        cell.outputs.push(output);
        self.touch();
        true
    }
}

/// Kernel status as mirrored on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    #[default]
    Idle,
    Running,
    Error,
}

impl KernelStatus {
    /// Map a server-reported status string onto the three client states.
    pub fn from_server(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" | "busy" | "starting" | "started" => KernelStatus::Running,
            "idle" | "stopped" | "not_started" => KernelStatus::Idle,
            _ => KernelStatus::Error,
        }
    }
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Running => write!(f, "running"),
            KernelStatus::Error => write!(f, "error"),
        }
    }
}

/// Client-only execution state: which cells are executing, which markdown
/// cells are in edit mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTracker {
    executing: BTreeSet<usize>,
    editing: BTreeSet<usize>,
}

impl ExecutionTracker {
    /// Returns true if `index` was not already executing.
    pub fn mark_executing(&mut self, index: usize) -> bool {
        self.executing.insert(index)
    }

    /// Clear the executing flag for `index` only. Returns true if it was set.
    pub fn settle(&mut self, index: usize) -> bool {
        self.executing.remove(&index)
    }

    pub fn is_executing(&self, index: usize) -> bool {
        self.executing.contains(&index)
    }

    pub fn any_executing(&self) -> bool {
        !self.executing.is_empty()
    }

    pub fn executing(&self) -> Vec<usize> {
        self.executing.iter().copied().collect()
    }

    pub fn set_editing(&mut self, index: usize, editing: bool) {
        if editing {
            self.editing.insert(index);
        } else {
            self.editing.remove(&index);
        }
    }

    pub fn is_editing(&self, index: usize) -> bool {
        self.editing.contains(&index)
    }

    pub fn editing(&self) -> Vec<usize> {
        self.editing.iter().copied().collect()
    }

    pub fn clear_executing(&mut self) {
        self.executing.clear();
    }

    pub fn reset(&mut self) {
        self.executing.clear();
        self.editing.clear();
    }
}

/// Everything the dispatcher mutates.
#[derive(Debug, Clone, Default)]
pub struct NotebookState {
    pub notebook: Notebook,
    pub tracker: ExecutionTracker,
}

impl NotebookState {
    pub fn new(notebook: Notebook) -> Self {
        Self {
            notebook,
            tracker: ExecutionTracker::default(),
        }
    }
}
