//! Applies decoded server events to the notebook state.
//!
//! The dispatcher is pure: it mutates [`NotebookState`] and returns the
//! side effects (replies to send, autosave triggers, execution transitions)
//! for the session to carry out.

use log::debug;
use serde_json::Value;

use crate::cell::{Cell, CellType};
use crate::notebook::NotebookState;
use crate::protocol::{CellSummary, ClientEvent, ExecutionPhase, ServerEvent};

/// Agent-channel traffic forwarded to the embedder untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Message {
        message: String,
        sender: Option<String>,
    },
    TaskCompleted {
        result: Option<Value>,
    },
}

/// A side effect produced by applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The cell list changed; schedule an autosave.
    CellsMutated,
    /// Send this event back on the connection it arrived on.
    Reply(ClientEvent),
    ExecutionStarted(usize),
    ExecutionSettled(usize),
    FileCompletion {
        request_id: String,
        files: Vec<String>,
    },
    Agent(AgentEvent),
}

/// Apply `event` to `state`. Events addressed to indices that do not exist
/// are dropped, except read-back requests, which always get a reply.
pub fn dispatch(state: &mut NotebookState, event: ServerEvent) -> Vec<Effect> {
    let mut effects = Vec::new();
    let notebook = &mut state.notebook;
    let tracker = &mut state.tracker;

    match event {
        ServerEvent::ExecutionResult {
            cell_index,
            status,
            output,
            append,
        } => {
            if status == ExecutionPhase::Running && notebook.cell(cell_index).is_some() {
                if tracker.mark_executing(cell_index) {
                    effects.push(Effect::ExecutionStarted(cell_index));
                }
                // Clearing only once per run keeps streamed chunks from
                // wiping each other out.
                if output.is_none() || !append {
                    notebook.clear_outputs(cell_index);
                    effects.push(Effect::CellsMutated);
                }
            }
            if let Some(output) = output {
                let applied = if append {
                    notebook.push_output(cell_index, output)
                } else {
                    notebook.replace_outputs(cell_index, vec![output])
                };
                if applied {
                    effects.push(Effect::CellsMutated);
                }
            }
            if matches!(status, ExecutionPhase::Completed | ExecutionPhase::Error)
                && tracker.settle(cell_index)
            {
                effects.push(Effect::ExecutionSettled(cell_index));
            }
        }
        ServerEvent::AddCell {
            cell_index,
            cell_type,
            content,
        } => {
            notebook.insert_cell(cell_index, Cell::with_content(cell_type, &content));
            effects.push(Effect::CellsMutated);
        }
        ServerEvent::DeleteCell { cell_index } => {
            if notebook.delete_cell(cell_index).is_some() {
                tracker.set_editing(cell_index, false);
                effects.push(Effect::CellsMutated);
            }
        }
        ServerEvent::AlterCellContent {
            cell_index,
            content,
        } => {
            if notebook.set_source(cell_index, &content) {
                effects.push(Effect::CellsMutated);
            }
        }
        ServerEvent::SwapCellType {
            cell_index,
            new_type,
        } => {
            if notebook.set_cell_type(cell_index, new_type) {
                if new_type == CellType::Markdown {
                    tracker.set_editing(cell_index, false);
                }
                effects.push(Effect::CellsMutated);
            }
        }
        ServerEvent::MoveCell {
            cell_index,
            new_index,
        } => {
            if notebook.move_cell(cell_index, new_index) {
                effects.push(Effect::CellsMutated);
            }
        }
        ServerEvent::ReadCellInputRequest {
            request_id,
            cell_index,
        } => {
            let content = notebook
                .cell(cell_index)
                .map(|c| c.source_text())
                .unwrap_or_default();
            effects.push(Effect::Reply(ClientEvent::ReadCellInputResponse {
                request_id,
                content,
            }));
        }
        ServerEvent::ReadCellOutputRequest {
            request_id,
            cell_index,
        } => {
            let outputs = notebook
                .cell(cell_index)
                .map(|c| c.outputs.clone())
                .unwrap_or_default();
            effects.push(Effect::Reply(ClientEvent::ReadCellOutputResponse {
                request_id,
                outputs,
            }));
        }
        ServerEvent::ListAllCellsRequest { request_id } => {
            let cells = notebook
                .cells()
                .iter()
                .enumerate()
                .map(|(i, c)| CellSummary::from_cell(i, c))
                .collect();
            effects.push(Effect::Reply(ClientEvent::ListAllCellsResponse {
                request_id,
                cells,
            }));
        }
        ServerEvent::FileCompletionResponse { request_id, files } => {
            effects.push(Effect::FileCompletion { request_id, files });
        }
        ServerEvent::AgentMessage { message, sender } => {
            effects.push(Effect::Agent(AgentEvent::Message { message, sender }));
        }
        ServerEvent::AgentTaskCompleted { result } => {
            effects.push(Effect::Agent(AgentEvent::TaskCompleted { result }));
        }
    }

    if effects.is_empty() {
        debug!("[notebook-dispatcher] Event had no effect (index out of range?)");
    }
    effects
}
