use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::{ChatSession, HttpTransport, StreamPhase, SubmitOutcome};
use crate::config::{normalize_base_url, ChatArgs};
use crate::models::{Message, Role};

const SUGGESTED_PREFIX: char = '?';

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Interactive chat about one case on stdin/stdout.
pub async fn run(args: ChatArgs) -> Result<()> {
    let server = normalize_base_url(&args.server)?;
    let mut transport = HttpTransport::new(server);
    if let (Some(user), Some(workspace)) = (args.user, args.workspace) {
        transport = transport.with_identity(user, workspace);
    }

    let session = Arc::new(ChatSession::new(args.case_id, Arc::new(transport)));
    session.open().await;

    let history = session.messages();
    for msg in &history {
        println!("{}: {}", label(msg.role), msg.content);
    }
    println!(
        "-- case {}: type a message, '{}' to ask a suggested question, Ctrl-C to stop a reply",
        session.case_id(),
        SUGGESTED_PREFIX
    );

    let renderer = tokio::spawn(render(
        session.subscribe(),
        session.phases(),
        history.len(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Option<JoinHandle<SubmitOutcome>> = None;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                pending = Some(dispatch(&session, line));
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if !session.stop() {
                    break;
                }
            }
        }
    }

    if let Some(handle) = pending {
        handle.await?;
    }
    session.close();
    renderer.abort();
    Ok(())
}

fn dispatch(session: &Arc<ChatSession>, line: String) -> JoinHandle<SubmitOutcome> {
    let session = session.clone();
    tokio::spawn(async move {
        let outcome = match line.trim().strip_prefix(SUGGESTED_PREFIX) {
            Some(question) => session.ask_suggested(question.trim()).await,
            None => session.submit(&line).await,
        };
        if outcome == SubmitOutcome::Rejected {
            if let Some(notice) = rejection_notice(&line) {
                eprintln!("{}", notice);
            }
        }
        outcome
    })
}

/// What to tell the user when a line was not sent. Blank lines are dropped
/// silently.
fn rejection_notice(line: &str) -> Option<&'static str> {
    let line = line.trim();
    if line.is_empty() {
        None
    } else if line.starts_with(SUGGESTED_PREFIX) {
        Some("-- not sent: a reply is still streaming or that question was just asked")
    } else {
        Some("-- not sent: a reply is still streaming (Ctrl-C stops it)")
    }
}

/// Print whatever part of the conversation has not been printed yet. The
/// assistant reply only ever grows, so each redraw prints the new suffix.
async fn render(
    mut messages: watch::Receiver<Vec<Message>>,
    mut phases: watch::Receiver<StreamPhase>,
    already_printed: usize,
) {
    let mut printer = Printer {
        current: already_printed,
        offset: 0,
        started: false,
    };
    loop {
        tokio::select! {
            changed = messages.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = messages.borrow_and_update().clone();
                printer.print(&snapshot);
            }
            changed = phases.changed() => {
                if changed.is_err() {
                    return;
                }
                let phase = *phases.borrow_and_update();
                if phase == StreamPhase::Idle {
                    let snapshot = messages.borrow().clone();
                    printer.print(&snapshot);
                    printer.end_turn(snapshot.len());
                }
            }
        }
    }
}

struct Printer {
    current: usize,
    offset: usize,
    started: bool,
}

impl Printer {
    fn print(&mut self, snapshot: &[Message]) {
        if snapshot.len() < self.current {
            // Conversation was reloaded.
            self.current = 0;
            self.offset = 0;
            self.started = false;
        }
        let mut out = std::io::stdout().lock();
        for (i, msg) in snapshot.iter().enumerate().skip(self.current) {
            // Typed messages were already echoed by the terminal.
            if msg.role != Role::User {
                if !self.started {
                    let _ = write!(out, "{}: ", label(msg.role));
                    self.started = true;
                }
                if let Some(rest) = msg.content.get(self.offset..) {
                    let _ = write!(out, "{}", rest);
                    self.offset = msg.content.len();
                }
            }
            if i + 1 < snapshot.len() {
                if self.started {
                    let _ = writeln!(out);
                }
                self.current = i + 1;
                self.offset = 0;
                self.started = false;
            }
        }
        let _ = out.flush();
    }

    fn end_turn(&mut self, len: usize) {
        if self.started {
            println!();
        }
        self.current = len;
        self.offset = 0;
        self.started = false;
    }
}
