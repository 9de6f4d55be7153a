//! Terminal front end used by the `order-desk` binary: prints order cards,
//! asks for confirmations and turns typed commands into engine calls.

use async_trait::async_trait;
use std::io::{BufRead, Write as _};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::dispatcher::{parse_eta_input, Confirm, DispatchOutcome, OrderAction};
use crate::engine::OrderEngine;
use crate::order::{ActionKind, OrderRecord};
use crate::render::{RenderHandle, Renderer};

const LINE_BUFFER: usize = 16;

/// Operator input shared by the command loop and confirmation prompts.
/// `None` from `recv` means end of input.
pub type SharedLines = Arc<Mutex<mpsc::Receiver<String>>>;

/// Operator input from stdin.
pub fn stdin_lines() -> SharedLines {
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
}

/// Read `reader` on a plain OS thread and forward each line over a channel.
///
/// Blocking reads stay off the runtime, so shutting the runtime down never
/// waits for the operator to press Enter. The thread exits at end of input,
/// on a read error, or once the receiver is gone.
pub fn spawn_line_reader<R>(reader: R) -> SharedLines
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let spawned = std::thread::Builder::new()
        .name("order-desk-stdin".into())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read operator input");
                        break;
                    }
                }
            }
            debug!("Operator input closed");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start operator input thread");
    }
    Arc::new(Mutex::new(rx))
}

fn print_line(line: &str) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

// ---------------------------------------------------------------------------
// Cards
// ---------------------------------------------------------------------------

pub fn card_text(record: &OrderRecord) -> String {
    let items = record
        .items
        .iter()
        .map(|i| format!("{}x {}", i.qty, i.name))
        .collect::<Vec<_>>()
        .join(", ");
    let eta = record
        .eta
        .map(|m| format!(" eta {m}m"))
        .or_else(|| record.arrival.as_ref().map(|a| format!(" eta {a}")))
        .unwrap_or_default();
    let actions = record
        .available_actions()
        .iter()
        .map(|a| match a {
            ActionKind::Approve => "approve",
            ActionKind::UpdateEta => "eta",
            ActionKind::Reject => "reject",
            ActionKind::Advance => "out",
            ActionKind::Complete => "done",
        })
        .collect::<Vec<_>>()
        .join("/");
    format!(
        "[{id}] {number} {status}{eta} | {customer} {phone} | {address} | {total} | {items} | {actions}",
        id = record.id,
        number = record.number,
        status = record.status,
        customer = record.customer,
        phone = record.phone,
        address = record.address,
        total = record.total,
    )
}

const AUDIO_LOCKED_HINT: &str = "sound is locked; type `unlock` to enable it";

pub struct ConsoleRenderer;

pub struct ConsoleCard {
    id: u64,
}

impl Renderer for ConsoleRenderer {
    type Handle = ConsoleCard;

    fn render(&mut self, record: &OrderRecord) -> ConsoleCard {
        print_line(&format!("+ {}", card_text(record)));
        if !record.note.is_empty() {
            print_line(&format!("    note: {}", record.note));
        }
        ConsoleCard { id: record.id }
    }

    fn audio_locked(&mut self) {
        print_line(AUDIO_LOCKED_HINT);
    }
}

impl RenderHandle for ConsoleCard {
    fn remove(&mut self) {
        print_line(&format!("- [{}] left the board", self.id));
    }

    fn update_status(&mut self, record: &OrderRecord) {
        print_line(&format!("~ {}", card_text(record)));
    }

    fn show_error(&mut self, action: ActionKind, message: &str) {
        print_line(&format!("! [{}] {action:?} failed: {message}", self.id));
    }
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

pub struct ConsoleConfirm {
    lines: SharedLines,
}

impl ConsoleConfirm {
    pub fn new(lines: SharedLines) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl Confirm for ConsoleConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        print_line(&format!("{prompt} [y/N]"));
        let mut lines = self.lines.lock().await;
        match lines.recv().await {
            Some(answer) => is_yes(&answer),
            None => false,
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Act { id: u64, action: OrderAction },
    List,
    Refresh,
    Ring,
    Unlock,
    Health,
    Help,
    Quit,
}

pub const HELP: &str = "commands: approve <id> [eta], eta <id> <minutes>, reject <id>, out <id>, \
done <id>, list, refresh, ring, unlock, health, help, quit";

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Err(HELP.to_string());
    };
    let verb = verb.to_ascii_lowercase();
    let mut order_id = || -> Result<u64, String> {
        parts
            .next()
            .ok_or_else(|| format!("{verb}: missing order id"))?
            .trim_start_matches('#')
            .parse()
            .map_err(|_| format!("{verb}: order id must be a number"))
    };

    let command = match verb.as_str() {
        "approve" | "a" => {
            let id = order_id()?;
            let eta = parse_eta_input(parts.next().unwrap_or("")).map_err(|e| e.to_string())?;
            Command::Act {
                id,
                action: OrderAction::Approve { eta },
            }
        }
        "eta" => {
            let id = order_id()?;
            let raw = parts.next().ok_or("eta: missing minutes")?;
            let eta = parse_eta_input(raw).map_err(|e| e.to_string())?;
            Command::Act {
                id,
                action: OrderAction::UpdateEta { eta },
            }
        }
        "reject" | "r" => Command::Act {
            id: order_id()?,
            action: OrderAction::Reject,
        },
        "out" | "o" => Command::Act {
            id: order_id()?,
            action: OrderAction::Advance,
        },
        "done" | "complete" | "d" => Command::Act {
            id: order_id()?,
            action: OrderAction::Complete,
        },
        "list" | "ls" => Command::List,
        "refresh" => Command::Refresh,
        "ring" => Command::Ring,
        "unlock" => Command::Unlock,
        "health" => Command::Health,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command {other:?}; {HELP}")),
    };
    Ok(command)
}

/// Read commands until `quit` or end of input.
pub async fn run_console(engine: Arc<OrderEngine>, lines: SharedLines) {
    print_line(HELP);
    loop {
        let line = {
            let mut guard = lines.lock().await;
            match guard.recv().await {
                Some(line) => line,
                None => break,
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                print_line(&message);
                continue;
            }
        };
        match command {
            Command::Act { id, action } => match engine.dispatch(id, action).await {
                Ok(DispatchOutcome::Navigated { url }) => {
                    print_line(&format!("[{id}] opened {url} in the browser"));
                }
                Ok(DispatchOutcome::Declined) => print_line("cancelled"),
                Ok(DispatchOutcome::Superseded) => {
                    print_line(&format!("[{id}] already updated by the server"));
                }
                Ok(_) => {}
                Err(e) => print_line(&format!("[{id}] {e}")),
            },
            Command::List => {
                for record in engine.snapshot() {
                    print_line(&card_text(&record));
                }
            }
            Command::Refresh => {
                let outcome = engine.force_poll().await;
                print_line(&format!("refresh: {outcome:?}"));
            }
            Command::Ring => {
                if engine.ring() == 0 {
                    print_line(AUDIO_LOCKED_HINT);
                }
            }
            Command::Unlock => {
                if engine.unlock_audio() {
                    print_line("sound enabled");
                }
            }
            Command::Health => match serde_json::to_string_pretty(&engine.health()) {
                Ok(json) => print_line(&json),
                Err(e) => print_line(&format!("health: {e}")),
            },
            Command::Help => print_line(HELP),
            Command::Quit => break,
        }
    }
}
