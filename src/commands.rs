//! Command execution.

use crate::{Commands, Target};
use colored::Colorize;
use rcplink_client::{ChangeEvent, Client, ClientError, SessionState};
use rcplink_protocol::catalog::parse_fixed;
use rcplink_protocol::{Command, ProtocolError, Value};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(
    client: &Client,
    cmd: Commands,
    timeout: Duration,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl | Commands::Watch { .. } | Commands::Params => {
            Err("not a one-shot command".into())
        }

        Commands::Get { target } => {
            let value = client
                .read(&target.address, target.row, target.column, timeout)
                .await?;
            Ok(format!(
                "{} = {}",
                format_target(&target),
                format_value(client, &target.address, &value).yellow()
            ))
        }

        Commands::Set { target, value } => {
            let mut inbound = client.subscribe_inbound();
            client.set_text(&target.address, target.row, target.column, &value)?;
            confirm(client, &mut inbound, &target, "Set", timeout).await
        }

        Commands::Toggle { target } => {
            let mut inbound = client.subscribe_inbound();
            client.toggle(&target.address, target.row, target.column)?;
            confirm(client, &mut inbound, &target, "Toggled", timeout).await
        }

        Commands::Adjust { target, delta } => {
            let def = client.catalog().require(&target.address)?;
            let raw = parse_fixed(&delta, def.kind.decimals()).ok_or_else(|| {
                ProtocolError::InvalidValue {
                    kind: def.kind.name(),
                    token: delta.clone(),
                }
            })?;

            let mut inbound = client.subscribe_inbound();
            client.adjust(&target.address, target.row, target.column, raw)?;
            confirm(client, &mut inbound, &target, "Adjusted", timeout).await
        }

        Commands::Raw { line, window_ms } => {
            let line = line.join(" ");
            let mut inbound = client.subscribe_inbound();
            if !client.send_raw(&line).await {
                return Err(Box::new(ClientError::NotConnected));
            }

            let mut output = Vec::new();
            let window = tokio::time::sleep(Duration::from_millis(window_ms));
            tokio::pin!(window);
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Ok(cmd) => output.push(cmd.to_string()),
                        Err(RecvError::Lagged(n)) => output.push(format!("(skipped {} lines)", n)),
                        Err(RecvError::Closed) => break,
                    },
                    _ = &mut window => break,
                }
            }

            if output.is_empty() {
                Ok("No response".dimmed().to_string())
            } else {
                Ok(output.join("\n"))
            }
        }
    }
}

/// Waits for the device to acknowledge a set of `target`.
async fn confirm(
    client: &Client,
    inbound: &mut broadcast::Receiver<Command>,
    target: &Target,
    verb: &str,
    timeout: Duration,
) -> Result<String, Box<dyn std::error::Error>> {
    let ack = tokio::time::timeout(timeout, async {
        loop {
            match inbound.recv().await {
                Ok(cmd)
                    if cmd.is_set()
                        && cmd.address == target.address
                        && cmd.row == target.row
                        && cmd.column == target.column =>
                {
                    return Ok(cmd);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(ClientError::ConnectionClosed),
            }
        }
    })
    .await;

    match ack {
        Ok(Ok(cmd)) if cmd.is_error() => Err(Box::new(ClientError::Rejected(cmd.to_string()))),
        Ok(Ok(cmd)) => {
            // Value-less acks confirm the value that was sent.
            let key = rcplink_client::CacheKey::new(&target.address, target.row, target.column);
            let value = cmd
                .value
                .or_else(|| client.connection().with_core(|core| core.peek(&key)));
            let shown = value
                .map(|v| format_value(client, &target.address, &v))
                .unwrap_or_default();
            Ok(format!(
                "{} {} = {}",
                verb.green(),
                format_target(target),
                shown.yellow()
            ))
        }
        Ok(Err(e)) => Err(Box::new(e)),
        Err(_) => Ok(format!(
            "{} {} {}",
            verb.green(),
            format_target(target),
            "(no acknowledgement)".dimmed()
        )),
    }
}

/// Prints cache changes until Ctrl+C, reconnecting with exponential backoff.
pub async fn watch(
    client: &Client,
    json: bool,
    addresses: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut changes = client.subscribe_changes();
    let mut state_rx = client.watch_state();
    let mut backoff = MIN_BACKOFF;

    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        if !client.is_connected() {
            match client.connect().await {
                Ok(()) => {
                    backoff = MIN_BACKOFF;
                    eprintln!("{} to {}", "Connected".green(), client.connection().config().addr());
                    poll(client, addresses);
                }
                Err(e) => {
                    eprintln!(
                        "{}: {} (retrying in {}s)",
                        "Connection failed".red(),
                        e,
                        backoff.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = tokio::signal::ctrl_c() => break,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        }

        tokio::select! {
            event = changes.recv() => {
                match event {
                    Ok(event) => println!("{}", format_event(client, &event, json)),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => {
                        eprintln!("{}", "Connection closed".red());
                        break;
                    }
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if state == SessionState::Failed {
                    eprintln!("{}", "Connection lost".red());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                break;
            }
        }
    }

    client.close().await?;
    Ok(())
}

/// Requests every coordinate of the given parameters.
fn poll(client: &Client, addresses: &[String]) {
    for address in addresses {
        let Some(def) = client.catalog().get(address) else {
            eprintln!("{}: unknown parameter {}", "Warning".yellow(), address);
            continue;
        };
        let rows = if def.indexed { def.rows.unwrap_or(1) } else { 1 };
        let columns = if def.indexed && !def.aggregate_columns {
            def.columns.unwrap_or(1)
        } else {
            1
        };
        for row in 0..rows {
            for column in 0..columns {
                if let Err(e) = client.request(address, row, column) {
                    eprintln!("{}: {}", "Warning".yellow(), e);
                }
            }
        }
    }
}

/// Lists the catalog sorted by address.
pub fn list_params(client: &Client) -> String {
    let mut defs: Vec<_> = client.catalog().iter().collect();
    if defs.is_empty() {
        return "No parameters in catalog".yellow().to_string();
    }
    defs.sort_by(|a, b| a.address.cmp(&b.address));

    let mut output = String::new();
    for def in defs {
        let bounds = match (def.rows, def.columns) {
            (Some(rows), Some(columns)) => format!(" [{}x{}]", rows, columns),
            (Some(rows), None) => format!(" [{} rows]", rows),
            _ => String::new(),
        };
        output.push_str(&format!(
            "  {} {}{} {:?}\n",
            def.address.cyan(),
            def.kind.name(),
            bounds,
            def.access
        ));
    }
    output
}

fn format_target(target: &Target) -> String {
    format!("{} [{}:{}]", target.address.cyan(), target.row, target.column)
}

/// Formats a raw value in engineering units.
pub fn format_value(client: &Client, address: &str, value: &Value) -> String {
    client
        .catalog()
        .get(address)
        .and_then(|def| def.format_value(value).ok())
        .unwrap_or_else(|| value.to_string())
}

fn format_event(client: &Client, event: &ChangeEvent, json: bool) -> String {
    if json {
        return serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
    }
    let value = format_value(client, &event.key.address, &event.value);
    match &event.previous {
        Some(previous) => format!(
            "{} = {} {}",
            event.key.to_string().cyan(),
            value.yellow(),
            format!("(was {})", format_value(client, &event.key.address, previous)).dimmed()
        ),
        None => format!("{} = {}", event.key.to_string().cyan(), value.yellow()),
    }
}
