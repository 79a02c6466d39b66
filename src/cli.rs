//! Command line surface

use std::io::{self, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::BackendKind;
use crate::bridge::{attach_stdio, BridgeOutcome};
use crate::config::CONFIG_PATH_VAR;
use crate::dispatcher::{render_table, Dispatcher, HostInfo};
use crate::error::{Result, XpctlError};
use crate::remote::{ConnectionParams, NewConnection};

/// Terminal client for the XPipe connection hub
#[derive(Parser, Debug)]
#[command(name = "xpctl", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// XPipe API base URL (default http://localhost:21721)
    #[arg(long, global = true, value_name = "URL")]
    pub api_url: Option<String>,

    /// Config file path
    #[arg(long, global = true, env = CONFIG_PATH_VAR, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open an interactive shell on a host (Ctrl-] detaches)
    Connect { host: String },
    /// Close the session for a host
    Disconnect { host: String },
    /// List declared hosts and their session status
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run one command on a host
    Exec {
        host: String,
        /// Command and arguments, after `--`. A single argument is sent as
        /// a complete command line.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Show a host's connection details
    Info {
        host: String,
        #[arg(long)]
        json: bool,
    },
    /// Declare a new host
    Add {
        name: String,
        /// ssh, docker or kubernetes
        #[arg(long)]
        kind: BackendKind,
        /// Host name, container name or pod name
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: Option<String>,
        /// Identity file the daemon should use
        #[arg(long)]
        identity: Option<String>,
        /// Store without testing the connection first
        #[arg(long)]
        no_validate: bool,
    },
    /// Remove a declared host
    Remove { host: String },
    /// Pick a host from a list and open a shell on it
    Browse,
    /// Interactive console (default)
    Console,
}

impl Cli {
    /// Log filter derived from -v / -q.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "xpctl=error";
        }
        match self.verbose {
            0 => "xpctl=warn",
            1 => "xpctl=info",
            2 => "xpctl=debug",
            _ => "xpctl=trace",
        }
    }

    pub fn wants_json(&self) -> bool {
        matches!(
            self.command,
            Some(Command::List { json: true }) | Some(Command::Info { json: true, .. })
        )
    }
}

impl Command {
    pub fn add_request(&self) -> Option<NewConnection> {
        match self {
            Command::Add {
                name,
                kind,
                address,
                port,
                user,
                identity,
                no_validate,
            } => Some(NewConnection {
                name: name.clone(),
                kind: *kind,
                params: ConnectionParams {
                    address: Some(address.clone()),
                    port: *port,
                    user: user.clone(),
                    auth_ref: identity.clone(),
                },
                validate: !no_validate,
            }),
            _ => None,
        }
    }
}

/// Run one command; returns the process exit code.
pub async fn execute(command: Command, dispatcher: &Dispatcher) -> Result<u8> {
    match command {
        Command::Connect { host } => connect_interactive(dispatcher, &host).await,
        Command::Disconnect { host } => {
            match dispatcher.disconnect(&host).await? {
                Some(session) => println!("Disconnected from {}", session.connection_name),
                None => println!("{}: not connected", host),
            }
            Ok(0)
        }
        Command::List { json } => {
            let rows = dispatcher.list().await?;
            if json {
                println!("{}", to_json(&rows)?);
            } else {
                print!("{}", render_table(&rows, Utc::now()));
            }
            Ok(0)
        }
        Command::Exec { host, command } => {
            exec_once(dispatcher, &host, &command_line(&command)).await
        }
        Command::Info { host, json } => {
            let info = dispatcher.info(&host).await?;
            if json {
                println!("{}", to_json(&info)?);
            } else {
                print!("{}", render_info(&info));
            }
            Ok(0)
        }
        ref add @ Command::Add { .. } => {
            let new = add.add_request().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "not an add command")
            })?;
            let id = dispatcher.add(&new).await?;
            println!("Added {} ({})", new.name, id);
            Ok(0)
        }
        Command::Remove { host } => {
            let removed = dispatcher.remove(&host).await?;
            println!("Removed {}", removed.name);
            Ok(0)
        }
        Command::Browse => crate::picker::run(dispatcher).await,
        Command::Console => crate::repl::run(dispatcher).await,
    }
}

/// Bridge the controlling terminal to `host`, then disconnect.
pub async fn connect_interactive(dispatcher: &Dispatcher, host: &str) -> Result<u8> {
    let outcome = attach_shell(dispatcher, host, host).await?;
    eprintln!("{}", outcome.status_line(host));
    Ok(match outcome {
        BridgeOutcome::RemoteClosed {
            exit_code: Some(code),
        } => exit_status(code),
        BridgeOutcome::Failed(_) => 1,
        _ => 0,
    })
}

/// Run the shell bridge on the controlling terminal. The terminal is back
/// in its previous mode when this returns.
pub async fn attach_shell(
    dispatcher: &Dispatcher,
    host: &str,
    label: &str,
) -> Result<BridgeOutcome> {
    eprintln!("Connecting to {} (Ctrl-] to detach)", label);
    let interrupt = CancellationToken::new();
    let (terminal, guard) = attach_stdio(true, interrupt);
    let outcome = dispatcher.shell(host, terminal).await;
    drop(guard);
    outcome
}

/// Connect if needed, run `command`, and close the session if this call
/// opened it.
pub async fn exec_once(dispatcher: &Dispatcher, host: &str, command: &str) -> Result<u8> {
    let opened_here = dispatcher
        .registry()
        .find(host)?
        .map_or(true, |session| !session.is_active());
    dispatcher.connect(host).await?;

    let interrupt = CancellationToken::new();
    let watcher = interrupt_on_ctrl_c(interrupt.clone());
    let result = dispatcher.exec_cancellable(host, command, &interrupt).await;
    watcher.abort();

    if opened_here {
        if let Err(e) = dispatcher.disconnect(host).await {
            warn!("Disconnect after exec failed: {}", e);
        }
    }

    let output = result?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(output.stdout.as_bytes())?;
    stdout.flush()?;
    let mut stderr = io::stderr().lock();
    stderr.write_all(output.stderr.as_bytes())?;
    stderr.flush()?;
    Ok(exit_status(output.exit_code))
}

/// Command line for the remote shell. Several words are quoted so each
/// arrives as one argument; a single word is taken as written.
pub fn command_line(args: &[String]) -> String {
    match args {
        [line] => line.clone(),
        words => shell_words::join(words),
    }
}

/// Cancel `token` on the first Ctrl-C.
pub fn interrupt_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

/// Map a remote exit code onto a process exit code.
pub fn exit_status(code: i32) -> u8 {
    match code {
        0 => 0,
        1..=255 => code as u8,
        _ => 1,
    }
}

/// One-line error for stderr.
pub fn render_error(err: &XpctlError, json: bool) -> String {
    if json {
        serde_json::json!({ "error": err }).to_string()
    } else {
        format!("error: {}", err)
    }
}

pub fn render_info(info: &HostInfo) -> String {
    let c = &info.connection;
    let mut out = format!("Name:     {}\nId:       {}\nKind:     {} ({})\n", c.name, c.id, c.kind, c.store_type);
    if !c.category.is_empty() {
        out.push_str(&format!("Category: {}\n", c.category.join("/")));
    }
    if let Some(target) = c.display_target() {
        out.push_str(&format!("Target:   {}\n", target));
    }
    if let Some(auth) = &c.params.auth_ref {
        out.push_str(&format!("Auth:     {}\n", auth));
    }
    match &info.session {
        Some(session) => out.push_str(&format!(
            "Session:  {} ({}, since {})\n",
            session.id,
            session.state,
            session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )),
        None => out.push_str("Session:  idle\n"),
    }
    out
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| XpctlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, RemoteError};
    use crate::remote::ConnectionDescriptor;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exec_collects_args_after_separator() {
        let cli = Cli::try_parse_from(["xpctl", "exec", "db1", "--", "ls", "-la", "/tmp"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Exec {
                host: "db1".to_string(),
                command: vec!["ls".to_string(), "-la".to_string(), "/tmp".to_string()],
            })
        );
    }

    #[test]
    fn test_exec_keeps_argument_boundaries() {
        let cli = Cli::try_parse_from(["xpctl", "exec", "db1", "--", "grep", "a b", "f"]).unwrap();
        let Some(Command::Exec { command, .. }) = cli.command else {
            panic!("not an exec");
        };
        assert_eq!(command_line(&command), "grep 'a b' f");
    }

    #[test]
    fn test_command_line_plain_words_unquoted() {
        let words = |w: &[&str]| w.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(command_line(&words(&["ls", "-la", "/tmp"])), "ls -la /tmp");
        assert_eq!(command_line(&words(&["uname -a"])), "uname -a");
    }

    #[test]
    fn test_exec_requires_command() {
        assert!(Cli::try_parse_from(["xpctl", "exec", "db1"]).is_err());
    }

    #[test]
    fn test_no_subcommand_means_console() {
        let cli = Cli::try_parse_from(["xpctl"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.log_filter(), "xpctl=warn");
    }

    #[test]
    fn test_verbosity_flags() {
        let cli = Cli::try_parse_from(["xpctl", "-vv", "list"]).unwrap();
        assert_eq!(cli.log_filter(), "xpctl=debug");
        let cli = Cli::try_parse_from(["xpctl", "list", "-q"]).unwrap();
        assert_eq!(cli.log_filter(), "xpctl=error");
        assert!(Cli::try_parse_from(["xpctl", "-v", "-q", "list"]).is_err());
    }

    #[test]
    fn test_add_request() {
        let cli = Cli::try_parse_from([
            "xpctl", "add", "web", "--kind", "docker", "--address", "web-1", "--no-validate",
        ])
        .unwrap();
        let new = cli.command.unwrap().add_request().unwrap();
        assert_eq!(new.kind, BackendKind::Docker);
        assert_eq!(new.params.address.as_deref(), Some("web-1"));
        assert!(!new.validate);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Cli::try_parse_from([
            "xpctl", "add", "x", "--kind", "telnet", "--address", "h"
        ])
        .is_err());
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(255), 255);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(300), 1);
    }

    #[test]
    fn test_render_error() {
        let err = XpctlError::from(RemoteError::NotFound("db9".into()));
        assert_eq!(render_error(&err, false), "error: Not found: db9");
        assert_eq!(render_error(&err, true), r#"{"error":"Not found: db9"}"#);

        let err = XpctlError::from(ConfigError::MissingKey);
        assert!(render_error(&err, false).contains("XPCTL_API_KEY"));
    }

    #[test]
    fn test_render_info_idle() {
        let info = HostInfo {
            connection: ConnectionDescriptor {
                id: "c1".to_string(),
                name: "prod/db1".to_string(),
                category: vec!["prod".to_string()],
                kind: BackendKind::Ssh,
                store_type: "ssh".to_string(),
                params: ConnectionParams {
                    address: Some("10.0.0.5".to_string()),
                    port: None,
                    user: Some("root".to_string()),
                    auth_ref: None,
                },
            },
            session: None,
        };
        let text = render_info(&info);
        assert!(text.contains("Target:   root@10.0.0.5\n"));
        assert!(text.ends_with("Session:  idle\n"));
    }
}
