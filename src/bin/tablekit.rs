use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tablekit::config::load_config;
use tablekit::{EngineContext, Envelope, Record, Resp, Result, TableManager};
use tracing::{debug, error};

const USAGE: &str = "Usage: tablekit <config.toml> <command> [args]

Commands:
  tables
  describe <table> [--force]
  select <table> [json]
  insert <table> <json>
  update <table> <json> <where-json>
  delete <table> <where-json>
  clear-cache [table]";

/// Represents a parsed CLI command.
#[derive(Debug, PartialEq)]
enum Command {
    Tables,
    Describe { table: String, force: bool },
    Select { table: String, data: String },
    Insert { table: String, data: String },
    Update { table: String, data: String, where_: String },
    Delete { table: String, where_: String },
    ClearCache(Option<String>),
}

/// Parses the arguments following the config path. Returns `None` when they
/// do not form a command.
fn parse_command(args: &[String]) -> Option<Command> {
    let parts: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = match parts.as_slice() {
        ["tables"] => Command::Tables,
        ["describe", table] => Command::Describe {
            table: table.to_string(),
            force: false,
        },
        ["describe", table, "--force"] => Command::Describe {
            table: table.to_string(),
            force: true,
        },
        ["select", table] => Command::Select {
            table: table.to_string(),
            data: "{}".to_string(),
        },
        ["select", table, data] => Command::Select {
            table: table.to_string(),
            data: data.to_string(),
        },
        ["insert", table, data] => Command::Insert {
            table: table.to_string(),
            data: data.to_string(),
        },
        ["update", table, data, where_] => Command::Update {
            table: table.to_string(),
            data: data.to_string(),
            where_: where_.to_string(),
        },
        ["delete", table, where_] => Command::Delete {
            table: table.to_string(),
            where_: where_.to_string(),
        },
        ["clear-cache"] => Command::ClearCache(None),
        ["clear-cache", table] => Command::ClearCache(Some(table.to_string())),
        _ => return None,
    };
    Some(command)
}

/// Runs `command` and returns the JSON to print plus whether it succeeded.
fn run(manager: &TableManager, command: Command) -> Result<(String, bool)> {
    let envelope = match command {
        Command::Tables => {
            return Ok((serde_json::to_string_pretty(&manager.list_tables()?)?, true));
        }
        Command::Describe { table, force } => {
            let columns = manager.describe_table(&table, force)?;
            return Ok((serde_json::to_string_pretty(&*columns)?, true));
        }
        Command::Select { table, data } => {
            manager.select(&table, &Record::from_json_str(&data)?, None, None)?
        }
        Command::Insert { table, data } => manager.insert(&table, &Record::from_json_str(&data)?)?,
        Command::Update { table, data, where_ } => manager.update(
            &table,
            &Record::from_json_str(&data)?,
            &Record::from_json_str(&where_)?,
        )?,
        Command::Delete { table, where_ } => {
            manager.delete(&table, &Record::from_json_str(&where_)?)?
        }
        Command::ClearCache(table) => {
            let started = Instant::now();
            manager.clear_cache(table.as_deref())?;
            Envelope::new(Resp::Ok, started)
        }
    };
    Ok((envelope.to_json()?, !envelope.is_err()))
}

fn main() -> ExitCode {
    // Initialize the logging system; stdout is reserved for JSON output
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((config_path, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };
    let Some(command) = parse_command(rest) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    let manager = match load_config(config_path).and_then(EngineContext::new) {
        Ok(ctx) => TableManager::new(Arc::new(ctx)),
        Err(e) => {
            error!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };
    debug!(?command, "running command");

    match run(&manager, command) {
        Ok((json, ok)) => {
            println!("{}", json);
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(1)
        }
    }
}
