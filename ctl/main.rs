#![forbid(unsafe_code)]

//! `agent-relay-client`: terminal client for `agent-relay`.
//!
//! Keeps one logical session across reconnects. Lines typed on stdin are
//! sent as prompts; lines starting with `/` are client commands.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use agent_relay::transport::client::{ClientEvent, ConnectionState, TransportConfig};
use agent_relay::transport::driver::{spawn_transport, TransportHandle};

const HELP: &str = "\
commands:
  /folders        list folders
  /open <path>    attach to a folder
  /abort          interrupt the current turn
  /close          end the session (the next /open starts fresh)
  /reconnect      reconnect now if disconnected
  /quit           exit
anything else is sent as a prompt";

#[derive(Debug, Parser)]
#[command(
    name = "agent-relay-client",
    about = "Terminal client for agent-relay",
    version,
    long_about = None
)]
struct Cli {
    /// WebSocket endpoint of the relay.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Folder to attach to once connected.
    #[arg(long)]
    folder: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let (handle, mut events, task) = spawn_transport(TransportConfig::new(args.url.clone()));
    let mut pending_folder = args.folder;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("{HELP}");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event == ClientEvent::StateChanged(ConnectionState::Lobby) {
                    if let Some(folder) = pending_folder.take() {
                        let _ = handle.connect_folder(folder).await;
                    }
                }
                print_event(&event);
            }
            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !dispatch(&handle, line.trim()).await {
                            let _ = handle.close().await;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = handle.close().await;
                    }
                }
            }
        }
    }

    let _ = task.await;
}

/// Run one input line; `false` asks to quit.
async fn dispatch(handle: &TransportHandle, line: &str) -> bool {
    let result = match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => return true,
        ("/quit", _) => return false,
        ("/help", _) => {
            println!("{HELP}");
            return true;
        }
        ("/folders", _) => handle.list_folders().await,
        ("/open", path) if !path.trim().is_empty() => handle.connect_folder(path.trim()).await,
        ("/abort", _) => handle.abort().await,
        ("/close", _) => handle.close_session().await,
        ("/reconnect", _) => handle.foreground().await,
        (command, _) if command.starts_with('/') => {
            eprintln!("unknown command {command}, try /help");
            return true;
        }
        _ => handle.prompt(line).await,
    };
    if let Err(err) = result {
        eprintln!("{err}");
        return false;
    }
    true
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::StateChanged(ConnectionState::Connected {
            session_id,
            resumed,
        }) => {
            let mode = if *resumed { "resumed" } else { "new" };
            println!("[connected to session {session_id} ({mode})]");
        }
        ClientEvent::StateChanged(state) => println!("[{state:?}]"),
        ClientEvent::FolderList(folders) => {
            for folder in folders {
                println!("  {folder}");
            }
        }
        ClientEvent::PromptReceived => {}
        ClientEvent::AgentEvent { event, replayed } => {
            let marker = if *replayed { "~ " } else { "" };
            println!("{marker}{event}");
        }
        ClientEvent::HistoryStart => println!("[history]"),
        ClientEvent::HistoryEnd => println!("[end of history]"),
        ClientEvent::ProcessExited { code, signal } => {
            println!("[agent exited: code {code:?}, signal {signal:?}]");
        }
        ClientEvent::TurnFinished { reason } => {
            if let Some(reason) = reason {
                println!("[turn ended: {reason}]");
            }
        }
        ClientEvent::Error(message) => eprintln!("error: {message}"),
    }
}
