//! Out-of-band operator channels that feed resume signals into gates.

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::error::Result;
use crate::gate::InteractionGate;
use crate::job_manager::JobManager;

const FLAG_EXTENSION: &str = "resume";
const FLAG_POLL: Duration = Duration::from_millis(500);

/// Whatever an operator command ultimately acts on.
pub trait OperatorSink: Send + Sync {
    fn resume(&self, employer_id: &str) -> bool;
    fn stop(&self);
    fn blocked(&self) -> Vec<String>;
}

impl OperatorSink for InteractionGate {
    fn resume(&self, employer_id: &str) -> bool {
        self.signal_resume(employer_id)
    }

    fn stop(&self) {
        self.abort();
    }

    fn blocked(&self) -> Vec<String> {
        InteractionGate::blocked(self)
    }
}

/// A single worker's gate plus its stop flag, for one-machine collection.
pub struct WorkerControl {
    pub gate: Arc<InteractionGate>,
    pub stop: Arc<AtomicBool>,
}

impl OperatorSink for WorkerControl {
    fn resume(&self, employer_id: &str) -> bool {
        self.gate.signal_resume(employer_id)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.gate.abort();
    }

    fn blocked(&self) -> Vec<String> {
        self.gate.blocked()
    }
}

impl OperatorSink for JobManager {
    fn resume(&self, employer_id: &str) -> bool {
        self.resume_anywhere(employer_id)
    }

    fn stop(&self) {
        self.stop_all();
    }

    fn blocked(&self) -> Vec<String> {
        JobManager::blocked(self)
            .into_iter()
            .flat_map(|(_, ids)| ids)
            .collect()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Resume(String),
    Stop,
    Blocked,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match (parts.next()?, parts.next()) {
        ("resume" | "r", Some(id)) => Some(Command::Resume(id.to_string())),
        ("stop" | "quit", None) => Some(Command::Stop),
        ("blocked" | "status", None) => Some(Command::Blocked),
        _ => None,
    }
}

/// Applies one command and returns the reply shown to the operator.
pub fn apply(sink: &dyn OperatorSink, command: Command) -> String {
    match command {
        Command::Resume(id) => {
            if sink.resume(&id) {
                format!("resumed {}", id)
            } else {
                format!("nothing is blocked on {}", id)
            }
        }
        Command::Stop => {
            sink.stop();
            "stopping at the next checkpoint".to_string()
        }
        Command::Blocked => {
            let ids = sink.blocked();
            if ids.is_empty() {
                "no blocked employers".to_string()
            } else {
                format!("blocked: {}", ids.join(", "))
            }
        }
    }
}

/// Reads `resume <id>`, `blocked` and `stop` lines from stdin.
pub fn spawn_console_channel(sink: Arc<dyn OperatorSink>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("console".to_string()).spawn(move || {
        info!("Operator console ready: 'resume <employer_id>', 'blocked', 'stop'");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    error!("Console read failed: {}", e);
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(cmd) => info!("{}", apply(sink.as_ref(), cmd)),
                None => warn!("Unknown command '{}'", line.trim()),
            }
        }
    })
}

/// Consumes `<employer_id>.resume` flag files once; returns how many resumed.
///
/// Flags for employers nobody is blocked on are deleted too, so a stale
/// flag can never release a later, unrelated challenge.
pub fn consume_flags(dir: &Path, sink: &dyn OperatorSink) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut resumed = 0;
    let mut flags: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext == FLAG_EXTENSION))
        .collect();
    flags.sort();

    for path in flags {
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        fs::remove_file(&path)?;
        if sink.resume(&id) {
            info!("Resume flag consumed for '{}'", id);
            resumed += 1;
        } else {
            warn!("Resume flag for '{}' discarded: nothing blocked on it", id);
        }
    }
    Ok(resumed)
}

/// Polls `dir` for resume flags until `shutdown` is set.
pub fn spawn_flag_watcher(
    dir: PathBuf,
    sink: Arc<dyn OperatorSink>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    fs::create_dir_all(&dir)?;
    thread::Builder::new().name("flag-watcher".to_string()).spawn(move || {
        info!("Watching {:?} for <employer_id>.{} flags", dir, FLAG_EXTENSION);
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = consume_flags(&dir, sink.as_ref()) {
                error!("Flag watcher error: {}", e);
            }
            thread::sleep(FLAG_POLL);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateOutcome;

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_command("resume acme-1"), Some(Command::Resume("acme-1".to_string())));
        assert_eq!(parse_command("  r x "), Some(Command::Resume("x".to_string())));
        assert_eq!(parse_command("stop"), Some(Command::Stop));
        assert_eq!(parse_command("blocked"), Some(Command::Blocked));
        assert_eq!(parse_command("resume"), None);
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn flag_file_resumes_blocked_employer() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(InteractionGate::new());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait_for_resume("acme", Some(Duration::from_secs(5))))
        };
        while gate.blocked().is_empty() {
            thread::sleep(Duration::from_millis(2));
        }

        fs::write(dir.path().join("acme.resume"), "").unwrap();
        fs::write(dir.path().join("other.resume"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(consume_flags(dir.path(), gate.as_ref()).unwrap(), 1);
        assert_eq!(waiter.join().unwrap(), GateOutcome::Resumed);
        assert!(!dir.path().join("other.resume").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn worker_control_stop_sets_flag_and_aborts_gate() {
        let control = WorkerControl {
            gate: Arc::new(InteractionGate::new()),
            stop: Arc::new(AtomicBool::new(false)),
        };
        assert_eq!(apply(&control, Command::Stop), "stopping at the next checkpoint");
        assert!(control.stop.load(Ordering::SeqCst));
        assert!(control.gate.is_aborted());
    }

    #[test]
    fn apply_reports_unknown_employers() {
        let gate = InteractionGate::new();
        assert_eq!(apply(&gate, Command::Resume("x".into())), "nothing is blocked on x");
        assert_eq!(apply(&gate, Command::Blocked), "no blocked employers");
    }
}
