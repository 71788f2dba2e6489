use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use notebook_sync::notebook_name;
use notebook_sync::py_format;
use notebook_sync::session::{self, NoticeLevel, SessionEvent, SessionEvents};
use notebook_sync::settings::{
    load_settings, load_settings_from, save_settings, settings_path, settings_schema, Settings,
};
use notebook_sync::{ApiClient, CellType, ExecuteOutcome, KernelStatus, SessionConfig};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// How long to wait for the real-time connection before executing over HTTP.
const CONNECT_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Command-line client for pup notebook servers",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Notebook server URL (overrides settings and PUP_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List notebooks on the server
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Create an empty notebook
    Create { name: String },
    /// Delete a notebook
    Delete { name: String },
    /// Print a notebook's cells
    Show {
        name: String,
        /// Output the raw notebook document as JSON
        #[arg(long)]
        json: bool,
    },
    /// Kernel management
    Kernel {
        #[command(subcommand)]
        command: KernelCommands,
    },
    /// Execute cells and print their outputs
    Run {
        name: String,
        /// Only run the cell at this index (default: every code cell)
        #[arg(long)]
        cell: Option<usize>,
    },
    /// Follow a notebook's live activity until interrupted
    Watch { name: String },
    /// Ask the kernel for completions at a cursor position in a cell
    Complete {
        name: String,
        cell: usize,
        /// Cursor offset in characters
        cursor: usize,
    },
    /// Write a notebook out as a percent-format .py file
    Export { name: String, output: PathBuf },
    /// Create a notebook from a percent-format .py file
    Import {
        file: PathBuf,
        /// Notebook name (default: the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the effective client settings
    Config {
        /// Print the JSON schema of the settings file instead
        #[arg(long)]
        schema: bool,
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Change one setting in the settings file
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum KernelCommands {
    /// Show the kernel status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Restart the kernel
    Reset,
    /// Start the kernel if it is not running
    Ensure,
}

#[derive(Tabled)]
struct NotebookTableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "FILE")]
    file: String,
}

#[derive(Tabled)]
struct CellTableRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "TYPE")]
    cell_type: String,
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "OUTPUTS")]
    outputs: usize,
}

#[derive(Serialize)]
struct KernelStatusJson {
    server: String,
    status: KernelStatus,
}

/// First line of `text`, cut to `max_len` characters.
fn preview(text: &str, max_len: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_len {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings();
    if let Some(server) = cli.server {
        settings.server_url = server;
    }
    debug!("[pup] Using server {}", settings.server_url);

    match &cli.command {
        Commands::Config {
            command: Some(ConfigCommands::Set { key, value }),
            ..
        } => return set_config(key, value),
        Commands::Config { schema, .. } => return print_config(&settings, *schema),
        _ => {}
    }

    let api = ApiClient::new(&settings.server_url)
        .with_context(|| format!("Invalid server URL {:?}", settings.server_url))?;

    match cli.command {
        Commands::List { json } => list_notebooks(&api, json).await,
        Commands::Create { name } => {
            let name = api.create_notebook(&name).await?;
            println!("Created {}", name);
            Ok(())
        }
        Commands::Delete { name } => {
            api.delete_notebook(&name).await?;
            println!("Deleted {}", notebook_name::normalize(&name)?);
            Ok(())
        }
        Commands::Show { name, json } => show_notebook(&api, &name, json).await,
        Commands::Kernel { command } => kernel_command(&api, command, &settings).await,
        Commands::Run { name, cell } => run_cells(api, &settings, &name, cell).await,
        Commands::Watch { name } => watch(api, &settings, &name).await,
        Commands::Complete { name, cell, cursor } => {
            complete(api, &settings, &name, cell, cursor).await
        }
        Commands::Export { name, output } => export(&api, &name, &output).await,
        Commands::Import { file, name } => import(&api, &file, name).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Edit the settings file itself; environment overrides are not persisted.
fn set_config(key: &str, value: &str) -> Result<()> {
    let path = settings_path();
    let mut settings = load_settings_from(&path);
    settings.set(key, value)?;
    save_settings(&settings).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("[pup] Set {} in {}", key, path.display());
    println!("{} = {}", key, value);
    Ok(())
}

fn print_config(settings: &Settings, schema: bool) -> Result<()> {
    if schema {
        println!("{}", serde_json::to_string_pretty(&settings_schema())?);
    } else {
        println!("# {}", settings_path().display());
        println!("{}", serde_json::to_string_pretty(settings)?);
    }
    Ok(())
}

async fn list_notebooks(api: &ApiClient, json: bool) -> Result<()> {
    let names = api.list_notebooks().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }
    if names.is_empty() {
        println!("No notebooks on {}", api.base_url());
        return Ok(());
    }
    let rows: Vec<NotebookTableRow> = names
        .iter()
        .map(|file| NotebookTableRow {
            name: notebook_name::stem(file).to_string(),
            file: file.clone(),
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn show_notebook(api: &ApiClient, name: &str, json: bool) -> Result<()> {
    let doc = api.get_notebook(name).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }
    let rows: Vec<CellTableRow> = doc
        .cells
        .iter()
        .enumerate()
        .map(|(index, cell)| CellTableRow {
            index,
            cell_type: cell.cell_type.to_string(),
            source: preview(&cell.source_text(), 60),
            outputs: cell.outputs.len(),
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn kernel_command(
    api: &ApiClient,
    command: KernelCommands,
    settings: &Settings,
) -> Result<()> {
    match command {
        KernelCommands::Status { json } => {
            let status = api.kernel_status().await?;
            if json {
                let out = KernelStatusJson {
                    server: settings.server_url.clone(),
                    status,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Kernel: {}", status);
            }
        }
        KernelCommands::Reset => {
            api.reset_kernel().await?;
            println!("Kernel reset ({})", api.kernel_status().await?);
        }
        KernelCommands::Ensure => {
            api.ensure_kernel().await?;
            println!("Kernel: {}", api.kernel_status().await?);
        }
    }
    Ok(())
}

/// Wait until the session's connection opens. Returns false if it fails or
/// takes too long, in which case execution goes over HTTP.
async fn wait_for_connection(events: &mut SessionEvents) -> bool {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::KernelStatus(KernelStatus::Running) => return true,
                SessionEvent::KernelStatus(KernelStatus::Error) => return false,
                _ => {}
            }
        }
        false
    };
    tokio::time::timeout(CONNECT_WAIT, wait).await.unwrap_or(false)
}

/// Wait for `index` to stop executing. A dropped connection ends the wait
/// for executions that went out over it.
async fn wait_for_settle(events: &mut SessionEvents, index: usize, over_socket: bool) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Executing {
                cell_index,
                running: false,
            } if cell_index == index => return,
            SessionEvent::KernelStatus(KernelStatus::Idle | KernelStatus::Error) if over_socket => {
                return
            }
            SessionEvent::Notice(notice) if notice.level == NoticeLevel::Error => {
                eprintln!("{}", notice.message);
            }
            _ => {}
        }
    }
}

async fn run_cells(
    api: ApiClient,
    settings: &Settings,
    name: &str,
    only: Option<usize>,
) -> Result<()> {
    let (handle, mut events) = session::open(api, SessionConfig::from(settings), name).await?;
    if !wait_for_connection(&mut events).await {
        info!("[pup] No live connection, executing over HTTP");
    }

    let snapshot = handle.snapshot().await?;
    let indices: Vec<usize> = match only {
        Some(index) if index >= snapshot.cells.len() => {
            handle.close().await?;
            bail!(
                "{} has {} cells, no cell {}",
                snapshot.name,
                snapshot.cells.len(),
                index
            );
        }
        Some(index) => vec![index],
        None => (0..snapshot.cells.len())
            .filter(|&i| snapshot.cells[i].cell_type == CellType::Code)
            .collect(),
    };

    for index in indices {
        match handle.execute_cell(index).await? {
            ExecuteOutcome::Sent => wait_for_settle(&mut events, index, true).await,
            ExecuteOutcome::FallbackStarted => wait_for_settle(&mut events, index, false).await,
            ExecuteOutcome::Rejected => {
                println!("[{}] (empty, skipped)", index);
                continue;
            }
            ExecuteOutcome::Skipped => {
                println!("[{}] (not a code cell)", index);
                continue;
            }
        }

        let snapshot = handle.snapshot().await?;
        if let Some(cell) = snapshot.cells.get(index) {
            println!("[{}] {}", index, preview(&cell.source_text(), 72));
            for output in &cell.outputs {
                let text = output.display_text();
                if output.is_error() {
                    eprint!("{}", text);
                } else {
                    print!("{}", text);
                }
                if !text.ends_with('\n') && !text.is_empty() {
                    println!();
                }
            }
        }
    }

    handle.close().await?;
    Ok(())
}

async fn watch(api: ApiClient, settings: &Settings, name: &str) -> Result<()> {
    let (handle, mut events) = session::open(api, SessionConfig::from(settings), name).await?;
    println!("Watching {} (Ctrl-C to stop)", handle.name());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::CellsChanged { cells, revision }) => {
                    println!("cells: {} (revision {})", cells.len(), revision);
                }
                Some(SessionEvent::KernelStatus(status)) => println!("kernel: {}", status),
                Some(SessionEvent::Executing { cell_index, running }) => {
                    let state = if running { "running" } else { "done" };
                    println!("cell {}: {}", cell_index, state);
                }
                Some(SessionEvent::Notice(notice)) => {
                    println!(
                        "{} {:?}: {}",
                        notice.at.format("%H:%M:%S"),
                        notice.level,
                        notice.message
                    );
                }
                Some(SessionEvent::Agent(event)) => println!("agent: {:?}", event),
                None => break,
            },
        }
    }

    handle.close().await?;
    Ok(())
}

async fn complete(
    api: ApiClient,
    settings: &Settings,
    name: &str,
    cell: usize,
    cursor: usize,
) -> Result<()> {
    let (handle, _events) = session::open(api, SessionConfig::from(settings), name).await?;
    let completion = handle.complete(cell, cursor, true).await?;
    handle.close().await?;

    if completion.is_empty() {
        println!("No suggestions");
        return Ok(());
    }
    for candidate in &completion.matches {
        println!("{}", candidate);
    }
    Ok(())
}

async fn export(api: &ApiClient, name: &str, output: &Path) -> Result<()> {
    let doc = api.get_notebook(name).await?;
    tokio::fs::write(output, py_format::render(&doc.cells))
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Exported {} cells to {}", doc.cells.len(), output.display());
    Ok(())
}

async fn import(api: &ApiClient, file: &Path, name: Option<String>) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Import path has no file name")?,
    };
    let doc = py_format::parse(&text);
    let name = api.create_notebook(&name).await?;
    api.save_notebook(&name, &doc).await?;
    println!("Imported {} cells into {}", doc.cells.len(), name);
    Ok(())
}
