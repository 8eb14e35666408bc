use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::app::ChatApp;
use crate::services::{ChatEvent, StreamOutcome};

const HELP: &str = "\
Commands:
  /new                 start a new chat
  /list                list saved chats
  /open <n|id>         switch to a chat
  /delete <n|id>       delete a chat
  /retry               regenerate the last reply
  /export <n|id> [file] write a chat as Markdown
  /system [prompt]     set the system prompt (empty resets it)
  /help                show this help
  /quit                exit
Ctrl-C stops a reply in progress, or exits at the prompt.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    Open(String),
    Delete(String),
    Retry,
    Export { target: String, path: Option<PathBuf> },
    System(Option<String>),
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let arg = (!arg.is_empty()).then(|| arg.to_string());

    match (name, arg) {
        ("new", _) => Command::New,
        ("list" | "ls", _) => Command::List,
        ("open", Some(target)) => Command::Open(target),
        ("delete" | "rm", Some(target)) => Command::Delete(target),
        ("retry", _) => Command::Retry,
        ("export", Some(arg)) => match arg.split_once(char::is_whitespace) {
            Some((target, path)) => Command::Export {
                target: target.to_string(),
                path: Some(PathBuf::from(path.trim())),
            },
            None => Command::Export {
                target: arg,
                path: None,
            },
        },
        ("system", prompt) => Command::System(prompt),
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit" | "q", _) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

/// Resolve a 1-based list position, or else a unique id prefix, to a session id.
pub fn resolve_session(app: &ChatApp, target: &str) -> Option<String> {
    let sessions = app.sessions();
    if let Ok(n) = target.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| sessions.get(i))
            .map(|s| s.id.clone());
    }
    let mut matches = sessions.iter().filter(|s| s.id.starts_with(target));
    match (matches.next(), matches.next()) {
        (Some(session), None) => Some(session.id.clone()),
        _ => None,
    }
}

/// Routes Ctrl-C to the turn in progress, or to the prompt when idle.
#[derive(Clone, Default)]
pub struct Interrupts {
    turn: Arc<Mutex<Option<CancellationToken>>>,
    idle: Arc<Notify>,
}

impl Interrupts {
    /// Register a new turn and return the token that cancels it.
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot() = Some(token.clone());
        token
    }

    pub fn end_turn(&self) {
        self.slot().take();
    }

    pub fn interrupt(&self) {
        match self.slot().as_ref() {
            Some(token) => token.cancel(),
            None => self.idle.notify_one(),
        }
    }

    /// Resolves once an interrupt arrives while no turn is running.
    pub async fn idle_interrupted(&self) {
        self.idle.notified().await;
    }

    /// Install the process-wide Ctrl-C handler.
    pub fn listen(&self) -> tokio::task::JoinHandle<()> {
        let interrupts = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                interrupts.interrupt();
            }
        })
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.turn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub async fn run(app: &mut ChatApp) -> Result<()> {
    println!("murmur: {} (type /help for commands)", app.settings().model);
    print_history(app);

    let interrupts = Interrupts::default();
    let listener = interrupts.listen();
    let result = read_loop(app, &interrupts).await;
    listener.abort();
    result
}

async fn read_loop(app: &mut ChatApp, interrupts: &Interrupts) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = interrupts.idle_interrupted() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Command::Send(text) if text.is_empty() => {}
            Command::Send(text) => {
                app.set_input(text);
                run_turn(app, interrupts, false).await;
            }
            Command::New => {
                app.new_session().await;
                println!("Started a new chat.");
            }
            Command::List => print_sessions(app),
            Command::Open(target) => match resolve_session(app, &target) {
                Some(id) if app.select_session(&id) => print_history(app),
                _ => println!("No chat matches '{}'.", target),
            },
            Command::Delete(target) => {
                let deleted = match resolve_session(app, &target) {
                    Some(id) => app.delete_session(&id).await,
                    None => false,
                };
                if deleted {
                    println!("Deleted.");
                } else {
                    println!("No chat matches '{}'.", target);
                }
            }
            Command::Retry => run_turn(app, interrupts, true).await,
            Command::Export { target, path } => {
                let markdown = resolve_session(app, &target).and_then(|id| app.export_session(&id));
                match (markdown, path) {
                    (Some(md), Some(path)) => match std::fs::write(&path, md) {
                        Ok(()) => println!("Wrote {}", path.display()),
                        Err(e) => println!("Failed to write {}: {}", path.display(), e),
                    },
                    (Some(md), None) => println!("{}", md),
                    (None, _) => println!("No chat matches '{}'.", target),
                }
            }
            Command::System(prompt) => {
                app.set_system_prompt(prompt).await;
                println!("System prompt: {}", app.settings().effective_system_prompt());
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
            Command::Unknown(line) => println!("Unknown command: {} (try /help)", line),
        }

        if let Some(e) = app.storage_error() {
            println!("(history is not being saved: {})", e);
        }
    }

    Ok(())
}

async fn run_turn(app: &mut ChatApp, interrupts: &Interrupts, retry: bool) {
    let cancel = interrupts.begin_turn();

    let on_event = |event: ChatEvent| match event {
        ChatEvent::Fragment { delta, .. } => {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        ChatEvent::Complete { .. } => println!(),
        ChatEvent::Error { error, partial } => {
            if !partial.is_empty() {
                println!();
            }
            println!("Error: {} (type /retry to try again)", error);
        }
    };

    let result = if retry {
        app.retry(cancel, on_event).await
    } else {
        app.submit(cancel, on_event).await
    };
    interrupts.end_turn();

    match result {
        Ok(StreamOutcome::Cancelled { .. }) => println!("\n[stopped]"),
        Ok(_) => {}
        Err(e) => println!("{}", e),
    }
}

fn print_sessions(app: &ChatApp) {
    if app.sessions().is_empty() {
        println!("No chats yet.");
        return;
    }
    for (i, session) in app.sessions().iter().enumerate() {
        let marker = if app.active_session_id() == Some(session.id.as_str()) {
            '*'
        } else {
            ' '
        };
        println!(
            "{}{:>3}. {:<34} {}  {}",
            marker,
            i + 1,
            session.title,
            session.updated_at.format("%m-%d %H:%M"),
            &session.id[..8.min(session.id.len())]
        );
        if let Some(preview) = session.last_message_preview(60) {
            println!("       {}", preview.replace('\n', " "));
        }
    }
}

fn print_history(app: &ChatApp) {
    for msg in app.messages() {
        println!("[{}] {}", msg.role.as_str(), msg.content);
    }
}
