//! Line-command console driving a node.
//!
//! One command per stdin line. Store reads and writes go through the
//! coordinator's store; lifecycle commands (start/stop/reset) drive the
//! coordinator directly. Command output goes to stdout, node logs go
//! through tracing — they interleave but never mix.

use crate::ConsoleMessage;
use anyhow::Result;
use netsync_core::Coordinator;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get(String),
    /// Raw `key:value` argument, split later so malformed input can get a
    /// hint instead of being ignored.
    Set(String),
    List,
    Clients,
    Start,
    Stop,
    Reset,
    Help,
    Exit,
}

/// Parse one input line. `None` for blank lines and anything unknown.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "get" if !rest.is_empty() => Some(Command::Get(rest.to_string())),
        "set" if !rest.is_empty() => Some(Command::Set(rest.to_string())),
        "list" => Some(Command::List),
        "clients" => Some(Command::Clients),
        "start" => Some(Command::Start),
        "stop" => Some(Command::Stop),
        "reset" => Some(Command::Reset),
        "help" => Some(Command::Help),
        "exit" => Some(Command::Exit),
        _ => None,
    }
}

/// Split a `key:value` argument at the first colon. The value may be
/// empty; the key may not.
fn split_key_value(input: &str) -> Option<(&str, &str)> {
    let (key, value) = input.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// The line `get` prints: the stored message, or no output at all for an
/// absent key.
fn format_get(value: Option<ConsoleMessage>) -> Option<String> {
    value.map(|stored| stored.message)
}

/// Interactive console bound to one node.
pub struct Console {
    coordinator: Arc<Coordinator>,
}

impl Console {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Read stdin until `exit`, end of input, or Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        print_help();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if !self.handle_line(&line).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns `false` when the console should exit.
    async fn handle_line(&self, line: &str) -> bool {
        let Some(command) = parse_command(line) else {
            if !line.trim().is_empty() {
                println!("Unknown command. Type 'help' for the list.");
            }
            return true;
        };
        match command {
            Command::Get(key) => self.get(&key),
            Command::Set(raw) => self.set(&raw),
            Command::List => {
                for key in self.coordinator.store().list() {
                    println!("{key}");
                }
            }
            Command::Clients => {
                let peers = self.coordinator.peers().await;
                if peers.is_empty() {
                    println!("No known peers");
                }
                for peer in peers {
                    println!("{peer}");
                }
            }
            Command::Start => {
                if let Err(e) = self.coordinator.start().await {
                    eprintln!("Failed to start: {e}");
                }
            }
            Command::Stop => self.coordinator.stop().await,
            Command::Reset => self.coordinator.reset().await,
            Command::Help => print_help(),
            Command::Exit => return false,
        }
        true
    }

    fn get(&self, key: &str) {
        match self.coordinator.store().get::<ConsoleMessage>(key) {
            Ok(value) => {
                if let Some(line) = format_get(value) {
                    println!("{line}");
                }
            }
            Err(e) => eprintln!("Failed to read {key}: {e}"),
        }
    }

    fn set(&self, raw: &str) {
        let Some((key, value)) = split_key_value(raw) else {
            println!("Separate key and value with ':'  (set greeting:Hello)");
            return;
        };
        let message = ConsoleMessage {
            message: value.to_string(),
        };
        if let Err(e) = self.coordinator.store().set(key, Some(&message)) {
            eprintln!("Failed to set {key}: {e}");
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  set <key>:<value>   store a value under a key");
    println!("  get <key>           print the value under a key");
    println!("  list                print all keys");
    println!("  clients             print known peers");
    println!("  start / stop        join or leave the network");
    println!("  reset               wipe local data and peers");
    println!("  exit                quit");
}
