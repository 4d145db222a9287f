//! Operator commands read from stdin.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use blockforge::prelude::*;

use crate::storage::JsonStorage;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Stop { delay_secs: u64, message: Option<String> },
    Restart { delay_secs: u64 },
    Cancel,
    Players,
    Ban(String),
    Compact,
    Cpu,
    Help,
}

/// Parses one console line. Returns `None` for blank lines and
/// `Some(Err(..))` for anything unrecognized.
pub fn parse(line: &str) -> Option<Result<Command, String>> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let command = match verb.to_ascii_lowercase().as_str() {
        "stop" => {
            let delay_secs = match words.next().map(str::parse::<u64>) {
                Some(Ok(secs)) => secs,
                Some(Err(_)) => return Some(Err("usage: stop [seconds] [message]".into())),
                None => 0,
            };
            let rest: Vec<&str> = words.collect();
            let message = (!rest.is_empty()).then(|| rest.join(" "));
            Command::Stop { delay_secs, message }
        }
        "restart" => match words.next().map(str::parse::<u64>) {
            Some(Ok(delay_secs)) => Command::Restart { delay_secs },
            Some(Err(_)) => return Some(Err("usage: restart [seconds]".into())),
            None => Command::Restart { delay_secs: 0 },
        },
        "cancel" => Command::Cancel,
        "players" | "list" => Command::Players,
        "ban" => match words.next() {
            Some(name) => Command::Ban(name.to_string()),
            None => return Some(Err("usage: ban <name>".into())),
        },
        "compact" => Command::Compact,
        "cpu" => Command::Cpu,
        "help" | "?" => Command::Help,
        other => return Some(Err(format!("unknown command '{other}', try 'help'"))),
    };
    Some(Ok(command))
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Reads commands until stdin closes, then stops the server.
pub fn run(server: Arc<Server>, storage: Arc<JsonStorage>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match parse(&line) {
            None => {}
            Some(Err(usage)) => println!("{usage}"),
            Some(Ok(command)) => execute(&server, &storage, command),
        }
    }

    tracing::info!("console closed");
    server.shutdown(
        ShutdownParams::new(ShutdownReason::ProcessClosing)
            .kill_process(true)
            .initiated_by("console"),
        false,
    );
}

/// The shutdown request a command makes, if any. Every console shutdown
/// ends the process with the reason's exit code.
pub fn shutdown_params(command: &Command) -> Option<ShutdownParams> {
    match command {
        Command::Stop { delay_secs, message } => {
            let mut params = ShutdownParams::new(ShutdownReason::ShuttingDown)
                .delay(Duration::from_secs(*delay_secs))
                .kill_process(true)
                .initiated_by("console");
            if let Some(message) = message {
                params = params.reason_text(message.clone());
            }
            Some(params)
        }
        Command::Restart { delay_secs } => Some(
            ShutdownParams::new(ShutdownReason::Restarting)
                .delay(Duration::from_secs(*delay_secs))
                .restart(true)
                .kill_process(true)
                .reason_text("Server is restarting.")
                .initiated_by("console"),
        ),
        _ => None,
    }
}

fn execute(server: &Server, storage: &JsonStorage, command: Command) {
    if let Some(params) = shutdown_params(&command) {
        println!("{:?}", server.shutdown(params, false));
        return;
    }
    match command {
        Command::Stop { .. } | Command::Restart { .. } => {}
        Command::Cancel => {
            if server.cancel_shutdown() {
                println!("shutdown cancelled");
            } else {
                println!("no pending shutdown");
            }
        }
        Command::Players => {
            let players = server.registry().players();
            let names: Vec<&str> = players.iter().map(|p| p.name()).collect();
            println!("{} online: {}", names.len(), names.join(", "));
        }
        Command::Ban(name) => {
            if !storage.ban(&name) {
                println!("{name} is already banned");
            }
            if let Some(player) = server.registry().find_player(&name) {
                player.kick("You are banned from this server.");
            }
        }
        Command::Compact => server.request_compaction(),
        Command::Cpu => match server.cpu_usage() {
            Some(usage) => println!("cpu {usage:.1}%"),
            None => println!("cpu usage not sampled yet"),
        },
        Command::Help => {
            println!("stop [seconds] [message] | restart [seconds] | cancel | players | ban <name> | compact | cpu");
        }
    }
}
