//! histview - browse and replay an audit log from the command line.

mod layers;
mod prompt;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use clap::{ArgGroup, Args, Parser, Subcommand};
use histview_core::logging::{init_logging, log_dir, LogConfig};
use histview_core::models::{DetailRows, GeometryDisplay};
use histview_core::services::event_model::COLUMN_HEADERS;
use histview_core::services::storage::{default_data_dir, init_data_dir, DEFAULT_PROJECT};
use histview_core::services::{HostServices, SchemaService};
use histview_core::{
    ActionSet, EventDetail, EventFilter, HistoryError, HistoryState, LocalStorage, ProjectSettings,
    TableRef,
};

use layers::ProjectLayers;
use prompt::TerminalPrompt;

#[derive(Parser, Debug)]
#[command(name = "histview")]
#[command(about = "Browse and replay an audit log", long_about = None)]
struct Cli {
    /// Directory holding the local settings database and logs
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Project whose settings are used
    #[arg(short, long, default_value = DEFAULT_PROJECT)]
    project: String,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show or change the project settings
    Configure {
        /// libpq connection string of the audited database
        #[arg(long, value_name = "CONNINFO")]
        db: Option<String>,
        /// Audit table as schema.table
        #[arg(long, value_name = "TABLE")]
        audit_table: Option<String>,
        /// Stored procedure replaying one event
        #[arg(long, value_name = "FUNCTION", conflicts_with = "no_replay")]
        replay_function: Option<String>,
        /// Disable replay
        #[arg(long)]
        no_replay: bool,
        /// Layer to table mapping as LAYER_ID=schema.table (repeatable)
        #[arg(long = "map", value_name = "LAYER_ID=TABLE")]
        table_map: Vec<String>,
    },
    /// List audit tables and replay functions found in the database
    Candidates,
    /// List the mapped layers that can be used with --layer
    Layers,
    /// List events
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Maximum number of events printed
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Show the decoded change set of one listed event
    Show {
        /// Row of the event in the list, starting at 0
        row: usize,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Replay one listed event
    Replay {
        /// Row of the event in the list, starting at 0
        row: usize,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args, Debug)]
#[command(group = ArgGroup::new("target").args(["table", "layer"]))]
struct FilterArgs {
    /// Only events of this table (schema.table)
    #[arg(long)]
    table: Option<String>,
    /// Only events of the table mapped to this layer id
    #[arg(long)]
    layer: Option<String>,
    /// Only events of this feature id; needs --table or --layer
    #[arg(long, requires = "target")]
    feature_id: Option<String>,
    /// Text searched in every value of the row
    #[arg(long)]
    search: Option<String>,
    /// Event types as action codes, e.g. "IU"
    #[arg(long, default_value = "IUD")]
    actions: String,
    /// Only events after this time (YYYY-MM-DD[THH:MM:SS])
    #[arg(long, value_parser = parse_time)]
    after: Option<NaiveDateTime>,
    /// Only events before this time (YYYY-MM-DD[THH:MM:SS])
    #[arg(long, value_parser = parse_time)]
    before: Option<NaiveDateTime>,
}

impl FilterArgs {
    fn to_filter(&self, state: &HistoryState) -> Result<EventFilter, HistoryError> {
        let base = match &self.layer {
            Some(layer) => state.filter_for_layer(layer, self.feature_id.as_deref())?,
            None => EventFilter {
                table: self.table.as_deref().map(TableRef::parse).transpose()?,
                feature_id: self.feature_id.clone(),
                ..Default::default()
            },
        };

        Ok(EventFilter {
            search: self.search.clone(),
            actions: ActionSet::from_codes(&self.actions)?,
            after: self.after,
            before: self.before,
            ..base
        })
    }
}

fn parse_time(s: &str) -> Result<NaiveDateTime, String> {
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(time) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(time);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("invalid time '{s}', expected YYYY-MM-DD[THH:MM:SS]"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    let logs = if cli.data_dir.is_some() { data_dir.join("logs") } else { log_dir() };
    let _logging_guard = init_logging(LogConfig::new(logs).verbose(cli.verbose));

    tracing::debug!(command = ?cli.command, "Starting histview");

    match run(cli, data_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(HistoryError::UserCancelled) => {
            eprintln!("Cancelled");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            let info = e.to_error_info();
            eprintln!("{}: {}", info.error_type, info.message);
            if let Some(hint) = info.hint {
                eprintln!("Hint: {hint}");
            }
            if let Some(detail) = info.technical_detail {
                eprintln!("{detail}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, data_dir: PathBuf) -> Result<(), HistoryError> {
    init_data_dir(&data_dir)?;
    let storage = LocalStorage::open(data_dir)?.with_project(cli.project);
    let project = ProjectSettings::load(&storage)?;
    let host = HostServices {
        coordinator: None,
        prompt: Arc::new(TerminalPrompt),
        layers: Arc::new(ProjectLayers::from_table_map(&project.table_map)),
    };
    let mut state = HistoryState::with_storage(storage, host)?;

    match cli.command {
        Command::Configure { db, audit_table, replay_function, no_replay, table_map } => {
            let mut settings = state.settings().clone();
            if let Some(db) = db {
                settings.db_connection = db;
            }
            if let Some(audit_table) = audit_table {
                TableRef::parse(&audit_table)?;
                settings.audit_table = audit_table;
            }
            if no_replay {
                settings.replay_function = None;
            } else if replay_function.is_some() {
                settings.replay_function = replay_function;
            }
            for entry in table_map {
                let (layer_id, table) = entry.split_once('=').ok_or_else(|| {
                    HistoryError::config(format!("invalid mapping '{entry}', expected LAYER_ID=TABLE"))
                })?;
                settings.table_map.insert(layer_id.to_string(), TableRef::parse(table)?);
            }
            state.configure(settings)?;
            print_settings(&state);
        }
        Command::Candidates => {
            state.open_connections()?;
            println!("Audit tables:");
            for table in SchemaService::audit_table_candidates(state.read_connection())? {
                println!("  {table}");
            }
            println!("Replay functions:");
            for function in SchemaService::replay_function_candidates(state.read_connection())? {
                println!("  {function}");
            }
        }
        Command::Layers => {
            for layer in state.mapped_layers() {
                println!("{}\t{}", layer.id, layer.table);
            }
        }
        Command::List { filter, limit } => {
            let filter = filter.to_filter(&state)?;
            let count = state.search(filter)?;
            println!("{} event(s)", count);
            println!("{}", COLUMN_HEADERS.join("\t"));
            if let Some(model) = state.model_mut() {
                for row in 0..count.min(limit) {
                    let cells = (0..COLUMN_HEADERS.len())
                        .map(|column| model.display(row, column).map(Option::unwrap_or_default))
                        .collect::<Result<Vec<_>, _>>()?;
                    println!("{row}\t{}", cells.join("\t"));
                }
            }
        }
        Command::Show { row, filter } => {
            let filter = filter.to_filter(&state)?;
            state.search(filter)?;
            let detail = state.event_detail(row)?;
            if let Some(event) = state.model_mut().map(|m| m.get(row)).transpose()? {
                println!(
                    "Event {} ({} on {} at {})",
                    event.event_id,
                    event.action.label(),
                    event.table_name,
                    event.timestamp
                );
            }
            print_detail(&detail);
        }
        Command::Replay { row, filter } => {
            state.open_connections()?;
            let filter = filter.to_filter(&state)?;
            state.search(filter)?;
            let outcome = state.replay(row)?;
            if !outcome.is_success() {
                return Err(HistoryError::query(outcome.error));
            }
            println!("Event replayed");
        }
    }

    Ok(())
}

fn print_settings(state: &HistoryState) {
    let settings = state.settings();
    println!("Project:         {}", state.storage().project());
    match settings.descriptor() {
        Ok(descriptor) => println!("Database:        {descriptor}"),
        Err(_) => println!("Database:        (not set)"),
    }
    println!("Audit table:     {}", settings.audit_table);
    println!("Replay function: {}", settings.replay_function.as_deref().unwrap_or("(disabled)"));
    for (layer, table) in &settings.table_map {
        println!("Layer {layer} -> {table}");
    }
}

fn print_detail(detail: &EventDetail) {
    let headers = detail.headers();
    println!("{}", headers.join("\t"));
    match &detail.rows {
        DetailRows::Values(entries) => {
            for entry in entries {
                println!("{}\t{}", entry.column, entry.value);
            }
        }
        DetailRows::Changes(changes) => {
            for change in changes {
                let marker = if change.changed { "*" } else { " " };
                println!(
                    "{marker}{}\t{}\t{}",
                    change.column,
                    change.old.as_deref().unwrap_or("NULL"),
                    change.new.as_deref().unwrap_or("NULL"),
                );
            }
        }
    }

    match &detail.geometry {
        Some(GeometryDisplay::Single(geometry)) => println!("Geometry: {}", geometry.type_name()),
        Some(GeometryDisplay::Pair { old, new }) => {
            println!("Geometry: {} -> {}", old.type_name(), new.type_name())
        }
        None => {}
    }
    if let Some(extent) = detail.geometry.as_ref().and_then(GeometryDisplay::extent) {
        println!(
            "Extent: {} {} {} {}",
            extent.min_x, extent.min_y, extent.max_x, extent.max_y
        );
    }
    for field in &detail.malformed {
        println!("Skipped {}: {}", field.column, field.reason);
    }
}
