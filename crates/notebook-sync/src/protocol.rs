//! Real-time channel message types.
//!
//! Every WebSocket text frame carries one JSON envelope:
//!
//! ```text
//! {"event": "move_cell", "data": {"cell_index": 0, "new_index": 2}}
//! ```
//!
//! Inbound envelopes decode into [`ServerEvent`], outbound ones are built
//! from [`ClientEvent`]. Decoding is the validation boundary: index fields
//! must be non-negative integers and string fields must be strings, anything
//! else is rejected here and never reaches the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cell::{Cell, CellType, Output};

/// Phase carried by an `execution_result` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Running,
    Completed,
    Error,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Streamed execution progress for one cell.
    ExecutionResult {
        cell_index: usize,
        status: ExecutionPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Output>,
        #[serde(default)]
        append: bool,
    },
    AddCell {
        cell_index: usize,
        #[serde(default)]
        cell_type: CellType,
        #[serde(default)]
        content: String,
    },
    DeleteCell {
        cell_index: usize,
    },
    AlterCellContent {
        cell_index: usize,
        content: String,
    },
    SwapCellType {
        cell_index: usize,
        new_type: CellType,
    },
    MoveCell {
        cell_index: usize,
        new_index: usize,
    },
    /// The server asks for the client's (authoritative, possibly unsaved)
    /// source of one cell.
    ReadCellInputRequest {
        request_id: String,
        cell_index: usize,
    },
    ReadCellOutputRequest {
        request_id: String,
        cell_index: usize,
    },
    ListAllCellsRequest {
        request_id: String,
    },
    FileCompletionResponse {
        request_id: String,
        #[serde(default)]
        files: Vec<String>,
    },
    AgentMessage {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    AgentTaskCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

impl ServerEvent {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ExecutionResult { .. } => "execution_result",
            ServerEvent::AddCell { .. } => "add_cell",
            ServerEvent::DeleteCell { .. } => "delete_cell",
            ServerEvent::AlterCellContent { .. } => "alter_cell_content",
            ServerEvent::SwapCellType { .. } => "swap_cell_type",
            ServerEvent::MoveCell { .. } => "move_cell",
            ServerEvent::ReadCellInputRequest { .. } => "read_cell_input_request",
            ServerEvent::ReadCellOutputRequest { .. } => "read_cell_output_request",
            ServerEvent::ListAllCellsRequest { .. } => "list_all_cells_request",
            ServerEvent::FileCompletionResponse { .. } => "file_completion_response",
            ServerEvent::AgentMessage { .. } => "agent_message",
            ServerEvent::AgentTaskCompleted { .. } => "agent_task_completed",
        }
    }
}

/// One entry of a `list_all_cells_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub index: usize,
    pub cell_type: CellType,
    pub source: String,
    pub outputs: Vec<Output>,
}

impl CellSummary {
    pub fn from_cell(index: usize, cell: &Cell) -> Self {
        Self {
            index,
            cell_type: cell.cell_type,
            source: cell.source_text(),
            outputs: cell.outputs.clone(),
        }
    }
}

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    ExecuteCode {
        cell_index: usize,
        code: String,
    },
    ReadCellInputResponse {
        request_id: String,
        content: String,
    },
    ReadCellOutputResponse {
        request_id: String,
        outputs: Vec<Output>,
    },
    ListAllCellsResponse {
        request_id: String,
        cells: Vec<CellSummary>,
    },
    FileCompletionRequest {
        request_id: String,
        query: String,
    },
    AgentMessage {
        message: String,
    },
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ExecuteCode { .. } => "execute_code",
            ClientEvent::ReadCellInputResponse { .. } => "read_cell_input_response",
            ClientEvent::ReadCellOutputResponse { .. } => "read_cell_output_response",
            ClientEvent::ListAllCellsResponse { .. } => "list_all_cells_response",
            ClientEvent::FileCompletionRequest { .. } => "file_completion_request",
            ClientEvent::AgentMessage { .. } => "agent_message",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid event envelope: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_move_cell() {
        let event =
            ServerEvent::decode(r#"{"event":"move_cell","data":{"cell_index":0,"new_index":2}}"#)
                .unwrap();
        assert_eq!(
            event,
            ServerEvent::MoveCell {
                cell_index: 0,
                new_index: 2
            }
        );
        assert_eq!(event.name(), "move_cell");
    }

    #[test]
    fn test_decode_execution_result_defaults() {
        let event = ServerEvent::decode(
            r#"{"event":"execution_result","data":{"cell_index":1,"status":"running"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::ExecutionResult {
                cell_index: 1,
                status: ExecutionPhase::Running,
                output: None,
                append: false,
            }
        );
    }

    #[test]
    fn test_decode_execution_result_with_stream_output() {
        let frame = json!({
            "event": "execution_result",
            "data": {
                "cell_index": 0,
                "status": "running",
                "append": true,
                "output": {"output_type": "stream", "name": "stdout", "text": "1\n"}
            }
        });
        let event = ServerEvent::decode(&frame.to_string()).unwrap();
        match event {
            ServerEvent::ExecutionResult { output, append, .. } => {
                assert!(append);
                assert_eq!(output.unwrap().display_text(), "1\n");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        // index as string
        assert!(
            ServerEvent::decode(r#"{"event":"delete_cell","data":{"cell_index":"0"}}"#).is_err()
        );
        // negative index
        assert!(
            ServerEvent::decode(r#"{"event":"delete_cell","data":{"cell_index":-1}}"#).is_err()
        );
        // content not a string
        assert!(ServerEvent::decode(
            r#"{"event":"alter_cell_content","data":{"cell_index":0,"content":5}}"#
        )
        .is_err());
        // unknown event
        assert!(ServerEvent::decode(r#"{"event":"explode","data":{}}"#).is_err());
        // not json
        assert!(ServerEvent::decode("hello").is_err());
    }

    #[test]
    fn test_encode_client_envelope() {
        let event = ClientEvent::ReadCellOutputResponse {
            request_id: "r1".into(),
            outputs: vec![],
        };
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "read_cell_output_response",
                "data": {"request_id": "r1", "outputs": []}
            })
        );
    }

    #[test]
    fn test_encode_execute_code() {
        let event = ClientEvent::ExecuteCode {
            cell_index: 2,
            code: "print(1)".into(),
        };
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "execute_code");
        assert_eq!(value["data"]["cell_index"], 2);
        assert_eq!(value["data"]["code"], "print(1)");
    }
}
