//! Interactive console
//!
//! Sessions live only as long as the process, so the console is where
//! `connect` followed by several `exec` calls makes sense.

use std::io::Write;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bridge::shared_stdin;
use crate::cli::{connect_interactive, interrupt_on_ctrl_c, render_error, render_info};
use crate::dispatcher::{render_table, Dispatcher};
use crate::error::Result;
use crate::session::{event_names, SessionEvent, SessionState};

const PROMPT: &str = "xpctl> ";

const HELP: &str = "\
Commands:
  list                    declared hosts and session status
  connect <host>          open a session
  shell <host>            attach the terminal to a session (Ctrl-] detaches)
  exec <host> <command>   run a command on a connected host
  info <host>             connection details
  disconnect <host>       close a session
  help                    this text
  quit                    disconnect everything and exit
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Connect(String),
    Shell(String),
    Exec { host: String, command: String },
    Info(String),
    Disconnect(String),
    Help,
    Quit,
    Empty,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let host = |name: &str| {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                Err(format!("usage: {} <host>", name))
            } else {
                Ok(rest.to_string())
            }
        };

        match word {
            "" => Ok(Self::Empty),
            "list" | "ls" => Ok(Self::List),
            "connect" => host("connect").map(Self::Connect),
            "shell" => host("shell").map(Self::Shell),
            "info" => host("info").map(Self::Info),
            "disconnect" => host("disconnect").map(Self::Disconnect),
            "exec" => match rest.split_once(char::is_whitespace) {
                Some((host, command)) if !command.trim().is_empty() => Ok(Self::Exec {
                    host: host.to_string(),
                    command: command.trim().to_string(),
                }),
                _ => Err("usage: exec <host> <command>".to_string()),
            },
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}' (try 'help')", other)),
        }
    }
}

/// Run the console until `quit` or end of input.
pub async fn run(dispatcher: &Dispatcher) -> Result<u8> {
    let mut events = dispatcher.registry().subscribe();
    let mut lines = BufReader::new(shared_stdin()).lines();

    loop {
        report_events(&mut events);
        print!("{}", PROMPT);
        std::io::stdout().flush()?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };

        let command = match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Quit) => break,
            Ok(command) => command,
            Err(usage) => {
                eprintln!("{}", usage);
                continue;
            }
        };

        if let Err(e) = run_one(dispatcher, command).await {
            eprintln!("{}", render_error(&e, false));
        }
    }

    for session in dispatcher.registry().list_active() {
        if let Err(e) = dispatcher.disconnect(&session.connection_id).await {
            warn!("Disconnect {} on exit failed: {}", session.connection_name, e);
        }
    }
    Ok(0)
}

async fn run_one(dispatcher: &Dispatcher, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::List => {
            let rows = dispatcher.list().await?;
            print!("{}", render_table(&rows, Utc::now()));
        }
        ConsoleCommand::Connect(host) => {
            let session = dispatcher.connect(&host).await?;
            println!("Connected to {} (session {})", session.connection_name, session.id);
        }
        ConsoleCommand::Shell(host) => {
            connect_interactive(dispatcher, &host).await?;
        }
        ConsoleCommand::Exec { host, command } => {
            let interrupt = CancellationToken::new();
            let watcher = interrupt_on_ctrl_c(interrupt.clone());
            let result = dispatcher.exec_cancellable(&host, &command, &interrupt).await;
            watcher.abort();

            let output = result?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if !output.success() {
                eprintln!("[exit {}]", output.exit_code);
            }
        }
        ConsoleCommand::Info(host) => {
            let info = dispatcher.info(&host).await?;
            print!("{}", render_info(&info));
        }
        ConsoleCommand::Disconnect(host) => match dispatcher.disconnect(&host).await? {
            Some(session) => println!("Disconnected from {}", session.connection_name),
            None => println!("{}: not connected", host),
        },
        ConsoleCommand::Help => print!("{}", HELP),
        ConsoleCommand::Quit | ConsoleCommand::Empty => {}
    }
    Ok(())
}

/// Print session failures that happened since the last prompt.
fn report_events(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => {
                if let Some(line) = event_notice(&event) {
                    eprintln!("{}", line);
                }
            }
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Missed {} session events", skipped);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

fn event_notice(event: &SessionEvent) -> Option<String> {
    if event.name != event_names::SESSION_STATE_CHANGED || event.state != SessionState::Failed {
        return None;
    }
    Some(format!(
        "[{}] session failed: {}",
        event.connection_name,
        event.message.as_deref().unwrap_or("unknown error")
    ))
}
