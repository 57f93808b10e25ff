//! Terminal front end: stdin commands in, call events out

use std::io::BufRead;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::warn;

use relaycall_core::models::PullState;
use relaycall_core::{CallEvent, CallHandle, CallSnapshot, UserIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Intent(UserIntent),
    Status,
    Help,
}

pub const HELP: &str = "commands: accept | decline | leave | retry | tracks | status | help";

pub fn parse_command(line: &str) -> Option<Command> {
    let command = match line.trim().to_ascii_lowercase().as_str() {
        "accept" | "a" => Command::Intent(UserIntent::Accept),
        "decline" | "d" => Command::Intent(UserIntent::Decline),
        "leave" | "l" | "quit" | "q" => Command::Intent(UserIntent::Leave),
        "retry" | "r" => Command::Intent(UserIntent::RetryFailedPulls),
        "tracks" | "t" => Command::Intent(UserIntent::LocalTracksChanged),
        "status" | "s" => Command::Status,
        "help" | "h" | "?" => Command::Help,
        _ => return None,
    };
    Some(command)
}

/// Forward stdin commands until the call ends or stdin closes
pub async fn read_commands(handle: CallHandle) {
    let mut lines = spawn_stdin_reader();
    println!("{HELP}");

    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Some(Command::Intent(intent)) => {
                if let Err(e) = handle.send(intent).await {
                    println!("{e}");
                    return;
                }
            }
            Some(Command::Status) => println!("{}", describe_snapshot(&handle.snapshot())),
            Some(Command::Help) => println!("{HELP}"),
            None => println!("unknown command {:?}; {HELP}", line.trim()),
        }
    }
}

/// Lines from stdin, read on a detached thread
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    return;
                }
            }
        }
    });
    rx
}

/// Print call events until the call ends
pub async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                println!("{}", describe_event(&event));
                if matches!(event, CallEvent::Ended(_)) {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

pub fn describe_event(event: &CallEvent) -> String {
    match event {
        CallEvent::StateChanged { from, to } => format!("state: {from} -> {to}"),
        CallEvent::ParticipantsChanged {
            inserted,
            updated,
            removed,
        } => format!(
            "participants: +{} ~{} -{}",
            inserted.len(),
            updated.len(),
            removed.len()
        ),
        CallEvent::TrackPulled {
            participant_id,
            track_id,
            mid,
        } => format!(
            "pulled {participant_id}/{track_id} (mid {})",
            mid.as_deref().unwrap_or("-")
        ),
        CallEvent::TrackFailed {
            participant_id,
            track_id,
            reason,
        } => format!("failed {participant_id}/{track_id}: {reason}"),
        CallEvent::Error(e) => format!("error: {e}"),
        CallEvent::Ended(reason) => format!("call ended: {reason}"),
    }
}

pub fn describe_snapshot(snapshot: &CallSnapshot) -> String {
    let mut out = format!("state: {}", snapshot.state);
    if let Some(session) = &snapshot.session {
        out.push_str(&format!(", session: {}", session.id));
    }

    for participant in &snapshot.participants {
        let pulled = participant
            .tracks
            .iter()
            .filter(|t| *t.pull_state() == PullState::Pulled)
            .count();
        out.push_str(&format!(
            "\n  {} ({:?}, {:?}): {}/{} tracks pulled",
            participant.id,
            participant.role,
            participant.state,
            pulled,
            participant.tracks.len()
        ));
    }

    if let Some(e) = &snapshot.last_error {
        out.push_str(&format!("\n  last error: {e}"));
    }
    out
}
