//! Interactive REPL.

use crate::commands;
use crate::{Commands, Target};
use colored::Colorize;
use rcplink_client::{CacheKey, Client};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

const HELP_TEXT: &str = r#"
Available commands:
  help                              Show this help

  get <addr> [row col]              Read a value from the device
  cached <addr> [row col]           Show the cached value (queues a fetch on miss)
  request <addr> [row col]          Queue a fetch without waiting
  set <addr> [row col] <value>      Write a value (engineering units)
  toggle <addr> [row col]           Invert a boolean parameter
  adjust <addr> [row col] <delta>   Change a numeric parameter
  copy <from> <row> <col> <to> <row> <col>
                                    Write one parameter from another

  raw <line>                        Send a line as-is
  params                            List the catalog
  status                            Show connection state
  stats                             Show session counters
  reset                             Drop the cache so reads poll again

  quit, exit                        Exit the REPL
"#;

pub async fn run(client: Client, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "rcplink".bold().cyan());
    println!("Connecting to {}...", addr);

    client.connect().await?;
    println!("{}", "Connected!".green());

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".rcplink_history"))
        .unwrap_or_else(|_| ".rcplink_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "rcplink>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "get" | "g" => {
            let Some(target) = parse_target(args)? else {
                return Ok(Some("Usage: get <addr> [row col]".to_string()));
            };
            let output = commands::execute(client, Commands::Get { target }, TIMEOUT).await?;
            Ok(Some(output))
        }

        "cached" => {
            let Some(target) = parse_target(args)? else {
                return Ok(Some("Usage: cached <addr> [row col]".to_string()));
            };
            match client.get(&target.address, target.row, target.column)? {
                Some(value) => Ok(Some(
                    commands::format_value(client, &target.address, &value)
                        .yellow()
                        .to_string(),
                )),
                None => Ok(Some("(not cached, fetch queued)".dimmed().to_string())),
            }
        }

        "request" => {
            let Some(target) = parse_target(args)? else {
                return Ok(Some("Usage: request <addr> [row col]".to_string()));
            };
            client.request(&target.address, target.row, target.column)?;
            Ok(Some("Queued".green().to_string()))
        }

        "set" | "s" => {
            let Some((target, value)) = parse_target_with_value(args)? else {
                return Ok(Some("Usage: set <addr> [row col] <value>".to_string()));
            };
            let output =
                commands::execute(client, Commands::Set { target, value }, TIMEOUT).await?;
            Ok(Some(output))
        }

        "toggle" => {
            let Some(target) = parse_target(args)? else {
                return Ok(Some("Usage: toggle <addr> [row col]".to_string()));
            };
            let output = commands::execute(client, Commands::Toggle { target }, TIMEOUT).await?;
            Ok(Some(output))
        }

        "adjust" => {
            let Some((target, delta)) = parse_target_with_value(args)? else {
                return Ok(Some("Usage: adjust <addr> [row col] <delta>".to_string()));
            };
            let output =
                commands::execute(client, Commands::Adjust { target, delta }, TIMEOUT).await?;
            Ok(Some(output))
        }

        "copy" => {
            if args.len() != 6 {
                return Ok(Some(
                    "Usage: copy <from> <row> <col> <to> <row> <col>".to_string(),
                ));
            }
            let from = CacheKey::new(args[0], args[1].parse()?, args[2].parse()?);
            let to = CacheKey::new(args[3], args[4].parse()?, args[5].parse()?);
            client.copy(&from, &to)?;
            Ok(Some(format!("{} {} -> {}", "Queued".green(), from, to)))
        }

        "raw" => {
            if args.is_empty() {
                return Ok(Some("Usage: raw <line>".to_string()));
            }
            let line = args.iter().map(|s| s.to_string()).collect();
            let output = commands::execute(
                client,
                Commands::Raw {
                    line,
                    window_ms: 500,
                },
                TIMEOUT,
            )
            .await?;
            Ok(Some(output))
        }

        "params" => Ok(Some(commands::list_params(client))),

        "status" => {
            let state = client.state();
            let text = match state.status() {
                Some(status) if state.is_connected() => status.to_string().green(),
                Some(status) => status.to_string().yellow(),
                None => "disconnected".red(),
            };
            Ok(Some(format!("{} (queue: {})", text, client.queue_len())))
        }

        "stats" => Ok(Some(serde_json::to_string_pretty(&client.stats())?)),

        "reset" => {
            let dropped = client.reset_poll();
            Ok(Some(format!("Dropped {} cached values", dropped)))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for available commands.",
            cmd
        ))),
    }
}

/// Parses `<addr> [row col]`.
fn parse_target(args: &[&str]) -> Result<Option<Target>, Box<dyn std::error::Error>> {
    match args {
        [address] => Ok(Some(target(address, 0, 0))),
        [address, row, column] => Ok(Some(target(address, row.parse()?, column.parse()?))),
        _ => Ok(None),
    }
}

/// Parses `<addr> [row col] <value...>`. String values may contain spaces.
fn parse_target_with_value(
    args: &[&str],
) -> Result<Option<(Target, String)>, Box<dyn std::error::Error>> {
    match args {
        [] | [_] => Ok(None),
        [address, row, column, rest @ ..]
            if !rest.is_empty() && row.parse::<u32>().is_ok() && column.parse::<u32>().is_ok() =>
        {
            Ok(Some((
                target(address, row.parse()?, column.parse()?),
                rest.join(" "),
            )))
        }
        [address, rest @ ..] => Ok(Some((target(address, 0, 0), rest.join(" ")))),
    }
}

fn target(address: &str, row: u32, column: u32) -> Target {
    Target {
        address: address.to_string(),
        row,
        column,
    }
}
