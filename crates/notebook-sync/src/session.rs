//! A live notebook session.
//!
//! One background task owns the cell store, the real-time connection, the
//! autosave timer and the reconnect timer, and processes everything one at a
//! time: commands from [`SessionHandle`]s, connection events, finished
//! background requests and timer expiries. Network calls (saves, HTTP
//! fallback execution, the socket itself) run in spawned tasks that report
//! back through an internal channel, so the session task never waits on the
//! network except when flushing on close.
//!
//! ```ignore
//! let api = ApiClient::new("http://localhost:8000")?;
//! let (handle, mut events) = session::open(api, SessionConfig::default(), "analysis").await?;
//! let index = handle.add_cell().await?;
//! handle.update_cell(index, CellPatch::source("print('hi')")).await?;
//! handle.execute_cell(index).await?;
//! while let Some(event) = events.recv().await { /* ... */ }
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::api::{ApiClient, ApiError};
use crate::autosave::AutosaveScheduler;
use crate::cell::{Cell, CellType, Output};
use crate::completion::{should_trigger, Completion, CompletionBridge};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::dispatcher::{dispatch, AgentEvent, Effect};
use crate::notebook::{CellPatch, KernelStatus, Notebook, NotebookState};
use crate::notebook_name::{self, NameError};
use crate::protocol::ClientEvent;
use crate::settings::Settings;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("Session closed")]
    ChannelClosed,
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws_path: String,
    pub autosave_delay: Duration,
    pub reconnect_delay: Duration,
    pub completion_timeout: Duration,
    pub completion_min_prefix: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            ws_path: settings.ws_path.clone(),
            autosave_delay: settings.autosave_delay(),
            reconnect_delay: settings.reconnect_delay(),
            completion_timeout: settings.completion_timeout(),
            completion_min_prefix: settings.completion_min_prefix,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: NoticeLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// State changes published to the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CellsChanged { cells: Vec<Cell>, revision: u64 },
    KernelStatus(KernelStatus),
    Executing { cell_index: usize, running: bool },
    Notice(Notification),
    Agent(AgentEvent),
}

/// What `execute_cell` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Missing index or not a code cell.
    Skipped,
    /// Empty source; a warning notice was published and nothing was sent.
    Rejected,
    /// `execute_code` went out on the live connection.
    Sent,
    /// No live connection; executing over HTTP instead.
    FallbackStarted,
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub name: String,
    pub cells: Vec<Cell>,
    pub revision: u64,
    pub kernel_status: KernelStatus,
    pub executing: Vec<usize>,
    pub editing: Vec<usize>,
    pub connection: ConnectionState,
}

#[derive(Debug)]
enum SessionCommand {
    AddCell {
        reply: oneshot::Sender<usize>,
    },
    UpdateCell {
        index: usize,
        patch: CellPatch,
        reply: oneshot::Sender<bool>,
    },
    DeleteCell {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
    MoveUp {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
    MoveDown {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
    ExecuteCell {
        index: usize,
        reply: oneshot::Sender<ExecuteOutcome>,
    },
    SetMarkdownEditing {
        index: usize,
        editing: bool,
        reply: oneshot::Sender<bool>,
    },
    Save {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    CellSource {
        index: usize,
        reply: oneshot::Sender<Option<String>>,
    },
    RequestFiles {
        query: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    SendAgentMessage {
        message: String,
        reply: oneshot::Sender<bool>,
    },
    KernelStatusObserved {
        status: KernelStatus,
        reply: oneshot::Sender<()>,
    },
    KernelReset {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveTrigger {
    Auto,
    Manual,
}

/// Completions of work spawned by the session task.
enum Internal {
    SaveFinished {
        trigger: SaveTrigger,
        result: Result<(), ApiError>,
        reply: Option<oneshot::Sender<Result<(), SessionError>>>,
    },
    FallbackExecuted {
        index: usize,
        result: Result<Vec<Output>, ApiError>,
    },
}

/// Clonable handle for driving a session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    name: String,
    api: ApiClient,
    completion: CompletionBridge,
    completion_timeout: Duration,
    completion_min_prefix: usize,
}

/// Receives [`SessionEvent`]s.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Returns `None` once the session has shut down.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Load `name` from the server and start a session for it. The real-time
/// connection is opened right away.
pub async fn open(
    api: ApiClient,
    config: SessionConfig,
    name: &str,
) -> Result<(SessionHandle, SessionEvents), SessionError> {
    let name = notebook_name::normalize(name)?;
    let doc = api.get_notebook(&name).await?;
    let ws_url = api.websocket_url(&config.ws_path)?;
    info!(
        "[notebook-session] Opened {} with {} cells",
        name,
        doc.cells.len()
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let session = Session {
        name: name.clone(),
        api: api.clone(),
        state: NotebookState::new(Notebook::from_document(doc)),
        kernel_status: KernelStatus::Idle,
        dropped_while_running: false,
        connection: ConnectionManager::new(ws_url),
        autosave: AutosaveScheduler::new(config.autosave_delay),
        reconnect_delay: config.reconnect_delay,
        reconnect_at: None,
        fallback_inflight: HashSet::new(),
        pending_files: HashMap::new(),
        events_tx,
        internal_tx,
    };
    tokio::spawn(run_session(session, cmd_rx, internal_rx));

    let handle = SessionHandle {
        tx: cmd_tx,
        name,
        completion: CompletionBridge::new(api.clone(), config.completion_timeout),
        api,
        completion_timeout: config.completion_timeout,
        completion_min_prefix: config.completion_min_prefix,
    };
    Ok((handle, SessionEvents { rx: events_rx }))
}

impl SessionHandle {
    /// Normalized notebook name.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Append an empty code cell. Returns its index.
    pub async fn add_cell(&self) -> Result<usize, SessionError> {
        self.request(|reply| SessionCommand::AddCell { reply }).await
    }

    pub async fn update_cell(&self, index: usize, patch: CellPatch) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::UpdateCell {
            index,
            patch,
            reply,
        })
        .await
    }

    pub async fn delete_cell(&self, index: usize) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::DeleteCell { index, reply })
            .await
    }

    pub async fn move_up(&self, index: usize) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::MoveUp { index, reply })
            .await
    }

    pub async fn move_down(&self, index: usize) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::MoveDown { index, reply })
            .await
    }

    pub async fn execute_cell(&self, index: usize) -> Result<ExecuteOutcome, SessionError> {
        self.request(|reply| SessionCommand::ExecuteCell { index, reply })
            .await
    }

    /// Enter or leave edit mode for a markdown cell. Returns false for code
    /// cells and missing indices.
    pub async fn set_markdown_editing(
        &self,
        index: usize,
        editing: bool,
    ) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::SetMarkdownEditing {
            index,
            editing,
            reply,
        })
        .await
    }

    /// Save now, bypassing the autosave timer. Resolves once the server has
    /// answered.
    pub async fn save(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Save { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    /// Code completion for the cell at `index`. Empty when the trigger
    /// heuristic declines, the cell is missing, or the server does not answer
    /// in time.
    pub async fn complete(
        &self,
        index: usize,
        cursor_pos: usize,
        explicit: bool,
    ) -> Result<Completion, SessionError> {
        let source = self
            .request(|reply| SessionCommand::CellSource { index, reply })
            .await?;
        let Some(source) = source else {
            return Ok(Completion::default());
        };
        if !should_trigger(&source, cursor_pos, self.completion_min_prefix, explicit) {
            return Ok(Completion::default());
        }
        Ok(self.completion.complete(&source, cursor_pos).await)
    }

    /// File-path completion over the real-time connection.
    pub async fn complete_file_path(&self, query: &str) -> Result<Vec<String>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::RequestFiles {
                query: query.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        match tokio::time::timeout(self.completion_timeout, reply_rx).await {
            Ok(Ok(files)) => Ok(files),
            Ok(Err(_)) => Ok(Vec::new()),
            Err(_) => {
                debug!("[notebook-session] File completion for {:?} timed out", query);
                Ok(Vec::new())
            }
        }
    }

    /// Returns false when there is no live connection to send on.
    pub async fn send_agent_message(&self, message: &str) -> Result<bool, SessionError> {
        let message = message.to_string();
        self.request(|reply| SessionCommand::SendAgentMessage { message, reply })
            .await
    }

    /// Ask the server for the kernel status and publish it.
    pub async fn refresh_kernel_status(&self) -> Result<KernelStatus, SessionError> {
        let (status, result) = match self.api.kernel_status().await {
            Ok(status) => (status, Ok(status)),
            Err(e) => (KernelStatus::Error, Err(SessionError::Api(e))),
        };
        self.request(|reply| SessionCommand::KernelStatusObserved { status, reply })
            .await?;
        result
    }

    /// Restart the kernel. Clears every executing flag.
    pub async fn reset_kernel(&self) -> Result<KernelStatus, SessionError> {
        self.api.reset_kernel().await?;
        self.request(|reply| SessionCommand::KernelReset { reply })
            .await?;
        self.refresh_kernel_status().await
    }

    /// Start the kernel if it is not running.
    pub async fn ensure_kernel(&self) -> Result<KernelStatus, SessionError> {
        self.api.ensure_kernel().await?;
        self.refresh_kernel_status().await
    }

    /// Flush a pending autosave, close the connection and stop the session.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Close { reply }).await
    }
}

struct Session {
    name: String,
    api: ApiClient,
    state: NotebookState,
    kernel_status: KernelStatus,
    /// Set when a transport error arrives while the kernel was running, so
    /// the following close still schedules a reconnect.
    dropped_while_running: bool,
    connection: ConnectionManager,
    autosave: AutosaveScheduler,
    reconnect_delay: Duration,
    reconnect_at: Option<Instant>,
    /// Cells executing over HTTP rather than the socket.
    fallback_inflight: HashSet<usize>,
    pending_files: HashMap<String, oneshot::Sender<Vec<String>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_session(
    mut session: Session,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
) {
    info!("[notebook-session] Starting session task for {}", session.name);
    session.connection.connect();

    loop {
        let autosave_deadline = session.autosave.deadline();
        let reconnect_at = session.reconnect_at;

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Close { reply }) => {
                    session.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Some(cmd) => session.handle_command(cmd),
                None => {
                    info!("[notebook-session] All handles dropped for {}", session.name);
                    session.shutdown().await;
                    break;
                }
            },
            Some(msg) = internal_rx.recv() => session.handle_internal(msg),
            event = session.connection.next_event() => session.handle_connection_event(event),
            _ = AutosaveScheduler::wait(autosave_deadline) => {
                if session.autosave.take_due(Instant::now()) {
                    session.spawn_save(SaveTrigger::Auto, None);
                }
            }
            _ = sleep_until_opt(reconnect_at) => {
                session.reconnect_at = None;
                info!("[notebook-session] Reconnecting {}", session.name);
                session.connection.connect();
            }
        }
    }

    info!("[notebook-session] Session task for {} stopped", session.name);
}

impl Session {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info | NoticeLevel::Success => info!("[notebook-session] {}", message),
            NoticeLevel::Warning => warn!("[notebook-session] {}", message),
            NoticeLevel::Error => error!("[notebook-session] {}", message),
        }
        self.emit(SessionEvent::Notice(Notification {
            level,
            message,
            at: Utc::now(),
        }));
    }

    fn set_kernel_status(&mut self, status: KernelStatus) {
        if self.kernel_status != status {
            self.kernel_status = status;
            self.emit(SessionEvent::KernelStatus(status));
        }
    }

    /// Publish the new cell list and debounce a save.
    fn cells_changed(&mut self) {
        self.emit(SessionEvent::CellsChanged {
            cells: self.state.notebook.cells().to_vec(),
            revision: self.state.notebook.revision(),
        });
        self.autosave.schedule();
    }

    fn execution_started(&mut self, index: usize) {
        self.autosave.suppress();
        self.emit(SessionEvent::Executing {
            cell_index: index,
            running: true,
        });
    }

    fn execution_settled(&mut self, index: usize) {
        self.emit(SessionEvent::Executing {
            cell_index: index,
            running: false,
        });
        if !self.state.tracker.any_executing() {
            self.autosave.resume();
        }
    }

    fn clear_executing(&mut self) {
        let executing = self.state.tracker.executing();
        self.state.tracker.clear_executing();
        self.fallback_inflight.clear();
        for index in executing {
            self.emit(SessionEvent::Executing {
                cell_index: index,
                running: false,
            });
        }
        self.autosave.resume();
    }

    /// Settle executions that went out over a socket that is now gone.
    /// HTTP fallbacks still in flight settle when their response arrives.
    fn settle_socket_executions(&mut self) {
        let stranded: Vec<usize> = self
            .state
            .tracker
            .executing()
            .into_iter()
            .filter(|index| !self.fallback_inflight.contains(index))
            .collect();
        for index in stranded {
            debug!(
                "[notebook-session] Cell {} lost its socket mid-execution",
                index
            );
            self.state.tracker.settle(index);
            self.execution_settled(index);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            name: self.name.clone(),
            cells: self.state.notebook.cells().to_vec(),
            revision: self.state.notebook.revision(),
            kernel_status: self.kernel_status,
            executing: self.state.tracker.executing(),
            editing: self.state.tracker.editing(),
            connection: self.connection.state(),
        }
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::AddCell { reply } => {
                let index = self.state.notebook.add_cell();
                self.cells_changed();
                let _ = reply.send(index);
            }
            SessionCommand::UpdateCell {
                index,
                patch,
                reply,
            } => {
                let becomes_code = patch.cell_type == Some(CellType::Code);
                let changed = self.state.notebook.update_cell(index, patch);
                if changed {
                    if becomes_code {
                        self.state.tracker.set_editing(index, false);
                    }
                    self.cells_changed();
                }
                let _ = reply.send(changed);
            }
            SessionCommand::DeleteCell { index, reply } => {
                let changed = self.state.notebook.delete_cell(index).is_some();
                if changed {
                    self.state.tracker.set_editing(index, false);
                    self.cells_changed();
                }
                let _ = reply.send(changed);
            }
            SessionCommand::MoveUp { index, reply } => {
                let changed = self.state.notebook.move_up(index);
                if changed {
                    self.cells_changed();
                }
                let _ = reply.send(changed);
            }
            SessionCommand::MoveDown { index, reply } => {
                let changed = self.state.notebook.move_down(index);
                if changed {
                    self.cells_changed();
                }
                let _ = reply.send(changed);
            }
            SessionCommand::ExecuteCell { index, reply } => {
                let outcome = self.execute_cell(index);
                let _ = reply.send(outcome);
            }
            SessionCommand::SetMarkdownEditing {
                index,
                editing,
                reply,
            } => {
                let is_markdown = self
                    .state
                    .notebook
                    .cell(index)
                    .is_some_and(|c| c.cell_type == CellType::Markdown);
                if is_markdown {
                    self.state.tracker.set_editing(index, editing);
                }
                let _ = reply.send(is_markdown);
            }
            SessionCommand::Save { reply } => {
                self.autosave.cancel();
                self.spawn_save(SaveTrigger::Manual, Some(reply));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::CellSource { index, reply } => {
                let source = self.state.notebook.cell(index).map(|c| c.source_text());
                let _ = reply.send(source);
            }
            SessionCommand::RequestFiles { query, reply } => self.request_files(query, reply),
            SessionCommand::SendAgentMessage { message, reply } => {
                let sent = self.connection.send(ClientEvent::AgentMessage { message });
                if !sent {
                    self.notify(NoticeLevel::Warning, "Not connected, agent message not sent");
                }
                let _ = reply.send(sent);
            }
            SessionCommand::KernelStatusObserved { status, reply } => {
                self.set_kernel_status(status);
                let _ = reply.send(());
            }
            SessionCommand::KernelReset { reply } => {
                self.clear_executing();
                self.notify(NoticeLevel::Info, "Kernel reset");
                let _ = reply.send(());
            }
            // Handled by the session loop.
            SessionCommand::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn execute_cell(&mut self, index: usize) -> ExecuteOutcome {
        let Some(cell) = self.state.notebook.cell(index) else {
            return ExecuteOutcome::Skipped;
        };
        if !cell.is_code() {
            return ExecuteOutcome::Skipped;
        }
        let code = cell.source_text();
        if code.trim().is_empty() {
            self.notify(
                NoticeLevel::Warning,
                format!("Cell {} is empty, nothing to execute", index + 1),
            );
            return ExecuteOutcome::Rejected;
        }

        self.state.tracker.mark_executing(index);
        self.execution_started(index);
        self.state.notebook.clear_outputs(index);
        self.cells_changed();

        if self.connection.send(ClientEvent::ExecuteCode {
            cell_index: index,
            code: code.clone(),
        }) {
            return ExecuteOutcome::Sent;
        }

        debug!(
            "[notebook-session] No live connection, executing cell {} over HTTP",
            index
        );
        self.fallback_inflight.insert(index);
        let api = self.api.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = api.execute(&code).await;
            let _ = tx.send(Internal::FallbackExecuted { index, result });
        });
        ExecuteOutcome::FallbackStarted
    }

    fn request_files(&mut self, query: String, reply: oneshot::Sender<Vec<String>>) {
        if !self.connection.is_open() {
            // Dropping the sender resolves the caller with no results.
            return;
        }
        self.pending_files.retain(|_, tx| !tx.is_closed());
        let request_id = uuid::Uuid::new_v4().to_string();
        let sent = self.connection.send(ClientEvent::FileCompletionRequest {
            request_id: request_id.clone(),
            query,
        });
        if sent {
            self.pending_files.insert(request_id, reply);
        }
    }

    fn spawn_save(
        &self,
        trigger: SaveTrigger,
        reply: Option<oneshot::Sender<Result<(), SessionError>>>,
    ) {
        let doc = self.state.notebook.to_document();
        let api = self.api.clone();
        let name = self.name.clone();
        let tx = self.internal_tx.clone();
        debug!("[notebook-session] {:?} save of {}", trigger, name);
        tokio::spawn(async move {
            let result = api.save_notebook(&name, &doc).await;
            let _ = tx.send(Internal::SaveFinished {
                trigger,
                result,
                reply,
            });
        });
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::SaveFinished {
                trigger,
                result,
                reply,
            } => {
                match (&result, trigger) {
                    (Ok(()), SaveTrigger::Auto) => {
                        debug!("[notebook-session] Autosaved {}", self.name)
                    }
                    (Ok(()), SaveTrigger::Manual) => {
                        self.notify(NoticeLevel::Success, format!("Saved {}", self.name))
                    }
                    (Err(e), SaveTrigger::Auto) => {
                        self.notify(NoticeLevel::Error, format!("Autosave failed: {}", e))
                    }
                    (Err(e), SaveTrigger::Manual) => {
                        self.notify(NoticeLevel::Error, format!("Save failed: {}", e))
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result.map_err(SessionError::from));
                }
            }
            Internal::FallbackExecuted { index, result } => {
                self.fallback_inflight.remove(&index);
                match result {
                    Ok(outputs) => {
                        if self.state.notebook.replace_outputs(index, outputs) {
                            self.cells_changed();
                        }
                    }
                    Err(e) => {
                        self.notify(NoticeLevel::Error, format!("Execution failed: {}", e));
                    }
                }
                if self.state.tracker.settle(index) {
                    self.execution_settled(index);
                }
            }
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                self.reconnect_at = None;
                self.dropped_while_running = false;
                self.clear_executing();
                self.state.tracker.reset();
                self.set_kernel_status(KernelStatus::Running);
                self.notify(NoticeLevel::Info, "Connected to kernel");
            }
            ConnectionEvent::Event(event) => {
                for effect in dispatch(&mut self.state, event) {
                    self.apply_effect(effect);
                }
            }
            ConnectionEvent::Error(message) => {
                self.dropped_while_running |= self.kernel_status == KernelStatus::Running;
                self.set_kernel_status(KernelStatus::Error);
                self.notify(NoticeLevel::Error, format!("Connection error: {}", message));
            }
            ConnectionEvent::Closed { reason } => {
                let was_running = self.kernel_status == KernelStatus::Running
                    || std::mem::take(&mut self.dropped_while_running);
                self.pending_files.clear();
                self.settle_socket_executions();
                self.set_kernel_status(KernelStatus::Idle);
                let message = match reason {
                    Some(reason) => format!("Disconnected from kernel: {}", reason),
                    None => "Disconnected from kernel".to_string(),
                };
                self.notify(NoticeLevel::Warning, message);
                if was_running {
                    info!(
                        "[notebook-session] Reconnecting to {} in {:?}",
                        self.connection.url(),
                        self.reconnect_delay
                    );
                    self.reconnect_at = Some(Instant::now() + self.reconnect_delay);
                }
            }
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::CellsMutated => self.cells_changed(),
            Effect::Reply(reply) => {
                let name = reply.name();
                if !self.connection.send(reply) {
                    warn!("[notebook-session] Could not send {}: not connected", name);
                }
            }
            Effect::ExecutionStarted(index) => self.execution_started(index),
            Effect::ExecutionSettled(index) => self.execution_settled(index),
            Effect::FileCompletion { request_id, files } => {
                match self.pending_files.remove(&request_id) {
                    Some(reply) => {
                        let _ = reply.send(files);
                    }
                    None => debug!(
                        "[notebook-session] No pending file completion {}",
                        request_id
                    ),
                }
            }
            Effect::Agent(event) => self.emit(SessionEvent::Agent(event)),
        }
    }

    /// Flush an owed autosave, then drop the connection.
    async fn shutdown(&mut self) {
        if self.autosave.is_pending() {
            self.autosave.cancel();
            let doc = self.state.notebook.to_document();
            match self.api.save_notebook(&self.name, &doc).await {
                Ok(()) => debug!("[notebook-session] Flushed pending save of {}", self.name),
                Err(e) => self.notify(NoticeLevel::Error, format!("Autosave failed: {}", e)),
            }
        }
        self.connection.close();
        self.pending_files.clear();
    }
}
