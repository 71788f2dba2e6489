//! notebook-sync - Client-side synchronization for pup notebook servers.
//!
//! This crate keeps an in-memory replica of one notebook in step with a
//! notebook server: it loads and saves the notebook over HTTP, applies the
//! server's real-time events (execution output, agent-driven cell edits,
//! read-back requests) received over a WebSocket, debounces autosaves, and
//! brokers code completion.
//!
//! Everything for one open notebook lives in a session task; embedders talk
//! to it through a [`SessionHandle`] and observe it through [`SessionEvents`].

pub mod api;
pub mod autosave;
pub mod cell;
pub mod completion;
pub mod connection;
pub mod dispatcher;
pub mod notebook;
pub mod notebook_name;
pub mod protocol;
pub mod py_format;
pub mod session;
pub mod settings;

pub use api::{ApiClient, ApiError};
pub use cell::{Cell, CellType, Output};
pub use completion::Completion;
pub use notebook::{CellPatch, KernelStatus, NotebookDocument};
pub use session::{
    open, ExecuteOutcome, NoticeLevel, Notification, SessionConfig, SessionError, SessionEvent,
    SessionEvents, SessionHandle, SessionSnapshot,
};
pub use settings::{load_settings, Settings};
