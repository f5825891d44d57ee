//! Operator console: feeds scans to the session manager and renders results.
//!
//! Input lines are scans, except lines starting with `:` which are commands:
//!
//! | Command         | Effect                                             |
//! |-----------------|----------------------------------------------------|
//! | `:select <id>`  | make `<id>` the next field to scan (re-verify)     |
//! | `:clear`        | drop the manual selection                          |
//! | `:retry`        | ask for the supervisor PIN again                   |
//! | `:record <key>` | select another master row (rebinds on next scan)   |
//! | `:reload`       | re-resolve the required fields                     |
//! | `:status`       | print the session                                  |
//! | `:quit`         | stop reading                                       |
//!
//! The supervisor PIN prompt reads from the same line source, so the loop and
//! the [`LinePinGate`] share it behind an async mutex. Ctrl+C ends the loop
//! even while a prompt is waiting for its answer.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use yansi::Paint;

use crate::master::MasterTable;
use crate::signal::ShutdownHandler;
use crate::verify::{
    BroadcastSink, FieldId, FieldState, PersistenceError, PinGate, Recovery, ScanOutcome,
    SessionEvent, SessionManager, SessionPhase, SessionSnapshot, VerifyError,
};

/// Line source shared between the scan loop and the PIN prompt.
pub type SharedLines = Arc<Mutex<Lines<Box<dyn AsyncBufRead + Send + Unpin>>>>;

/// Wrap a reader as a [`SharedLines`].
pub fn shared_lines<R>(reader: R) -> SharedLines
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    let boxed: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(reader);
    Arc::new(Mutex::new(boxed.lines()))
}

async fn next_line(lines: &SharedLines) -> Option<String> {
    match lines.lock().await.next_line().await {
        Ok(line) => line,
        Err(e) => {
            log::error!("Failed to read input: {}", e);
            None
        }
    }
}

/// PIN gate that prompts on stderr and reads the answer from the line source.
pub struct LinePinGate {
    pin: String,
    lines: SharedLines,
}

impl LinePinGate {
    /// Gate accepting `pin`.
    #[must_use]
    pub fn new(pin: impl Into<String>, lines: SharedLines) -> Self {
        Self {
            pin: pin.into(),
            lines,
        }
    }
}

#[async_trait]
impl PinGate for LinePinGate {
    async fn verify(&self, field: &FieldId) -> bool {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "Supervisor PIN to clear '{}': ", field);
        let _ = stderr.flush();

        match next_line(&self.lines).await {
            Some(answer) if answer.trim() == self.pin => true,
            Some(_) => {
                log::warn!("Wrong supervisor PIN for '{}'", field);
                false
            }
            None => false,
        }
    }
}

/// Broadcast sink printing each snapshot as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct JsonSnapshotSink;

impl BroadcastSink for JsonSnapshotSink {
    fn publish(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(snapshot)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line).map_err(|e| PersistenceError::Closed(e.to_string()))
    }
}

/// Where scans come from.
pub enum ScanInput {
    /// A fixed list (command-line `--scan` values).
    List(Vec<String>),
    /// Interactive lines, possibly with `:` commands.
    Lines(SharedLines),
}

/// Console rendering options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOptions {
    /// Machine-readable output: snapshots go through [`JsonSnapshotSink`],
    /// and the console prints nothing else.
    pub json: bool,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Units fully verified during the run
    pub completed_units: u64,
    /// Whether the bound session ended complete
    pub complete: bool,
    /// Whether Ctrl+C stopped the run
    pub interrupted: bool,
}

enum Step {
    Continue,
    Quit,
}

/// Drives the session manager from a [`ScanInput`].
pub struct Console<'a> {
    manager: &'a SessionManager,
    master: Option<Arc<MasterTable>>,
    options: ConsoleOptions,
    events: broadcast::Receiver<SessionEvent>,
}

impl<'a> Console<'a> {
    /// Console over `manager`. Subscribes to its events immediately.
    #[must_use]
    pub fn new(manager: &'a SessionManager, options: ConsoleOptions) -> Self {
        Self {
            manager,
            master: None,
            options,
            events: manager.subscribe(),
        }
    }

    /// Enable `:record` against a master table.
    #[must_use]
    pub fn with_master(mut self, master: Arc<MasterTable>) -> Self {
        self.master = Some(master);
        self
    }

    /// Process input until it ends, `:quit`, or shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Configuration`] when scanning is blocked.
    pub async fn run(
        mut self,
        input: ScanInput,
        shutdown: &ShutdownHandler,
    ) -> Result<RunSummary, VerifyError> {
        let mut interrupted = false;
        match input {
            ScanInput::List(scans) => {
                for scan in scans {
                    if shutdown.is_shutdown_requested() {
                        interrupted = true;
                        break;
                    }
                    self.scan(&scan).await?;
                }
            }
            ScanInput::Lines(lines) => loop {
                let line = tokio::select! {
                    () = shutdown.wait() => {
                        interrupted = true;
                        break;
                    }
                    line = next_line(&lines) => line,
                };
                let Some(line) = line else {
                    break;
                };
                // A scan may sit in the PIN prompt; Ctrl+C must still stop it.
                let handled = async {
                    match line.trim().strip_prefix(':') {
                        Some(command) => Ok(self.command(command).await),
                        None => self.scan(&line).await.map(|()| Step::Continue),
                    }
                };
                let step = tokio::select! {
                    () = shutdown.wait() => {
                        interrupted = true;
                        break;
                    }
                    step = handled => step?,
                };
                if matches!(step, Step::Quit) {
                    break;
                }
            },
        }

        Ok(RunSummary {
            completed_units: self.manager.completed_units(),
            complete: self
                .manager
                .snapshot()
                .is_some_and(|s| s.phase == SessionPhase::Complete),
            interrupted,
        })
    }

    async fn scan(&mut self, code: &str) -> Result<(), VerifyError> {
        let outcome = self.manager.handle_scan(code).await;
        self.drain_events();
        match outcome {
            Ok(outcome) => {
                self.report(code, &outcome);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn command(&mut self, command: &str) -> Step {
        let (name, arg) = match command.trim().split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command.trim(), ""),
        };
        match name {
            "select" if !arg.is_empty() => {
                if !self.manager.set_manual_active_field(arg) {
                    self.say(format!("'{}' is not a required field", arg).yellow());
                }
            }
            "clear" => {
                self.manager.clear_manual_active_field();
            }
            "retry" => match self.manager.retry_recovery().await {
                Some(recovery) => self.say(recovery_text(recovery)),
                None => self.say("No failed field to recover".yellow()),
            },
            "record" if !arg.is_empty() => {
                let selected = self.master.as_ref().and_then(|m| m.select(arg));
                match selected {
                    Some(_) => self.say(format!("Selected {}", arg).cyan()),
                    None => self.say(format!("No master row '{}'", arg).yellow()),
                }
            }
            "reload" => {
                self.manager.refresh().await;
            }
            "status" => self.print_status(),
            "quit" | "q" => return Step::Quit,
            _ => self.say(format!("Unknown command ':{}'", command.trim()).yellow()),
        }
        self.drain_events();
        Step::Continue
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.render_event(&event),
                Err(TryRecvError::Lagged(n)) => log::warn!("Skipped {} session events", n),
                Err(_) => break,
            }
        }
    }

    fn say<T: std::fmt::Display>(&self, message: T) {
        if !self.options.json {
            println!("{}", message);
        }
    }

    fn render_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::FieldFailed { .. } => {
                if !self.options.json {
                    // Terminal bell as the audible alert.
                    print!("\x07");
                }
            }
            SessionEvent::FieldRecovered { field } => {
                self.say(format!("'{}' cleared, scan it again", field).cyan());
            }
            SessionEvent::SessionComplete(summary) => {
                let key = summary.record_key.as_deref().unwrap_or("record");
                self.say(
                    format!(
                        "{} verified ({} scans, {} failed, {} units today)",
                        key, summary.attempts, summary.failures, summary.completed_units
                    )
                    .green()
                    .bold(),
                );
            }
            SessionEvent::SessionInvalid { missing } => {
                let ids: Vec<&str> = missing.iter().map(FieldId::as_str).collect();
                self.say(format!("Cannot scan: missing fields {}", ids.join(", ")).red());
            }
            SessionEvent::FieldMatched { .. } => {}
        }
    }

    fn report(&self, code: &str, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Matched { field, .. } => {
                self.say(format!("{} {} <- {}", "PASS".green().bold(), field, code));
            }
            ScanOutcome::Mismatched { field, recovery } => {
                self.say(format!("{} {} <- {}", "FAIL".red().bold(), field, code));
                self.say(recovery_text(*recovery));
            }
            ScanOutcome::Ignored { reason } => {
                log::info!("Scan '{}' ignored ({:?})", code, reason);
            }
        }
    }

    fn print_status(&self) {
        match self.manager.snapshot() {
            Some(snapshot) => self.say(render_snapshot(&snapshot)),
            None => self.say("No record bound".yellow()),
        }
    }
}

fn recovery_text(recovery: Recovery) -> String {
    match recovery {
        Recovery::Cleared => "Supervisor cleared the failure".cyan().to_string(),
        Recovery::Pending => "Field stays failed; rescan, :retry or :select"
            .yellow()
            .to_string(),
        Recovery::Stale => "Record changed; PIN answer discarded".dim().to_string(),
    }
}

/// One line per field, marked by state.
#[must_use]
pub fn render_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut out = format!(
        "{} [{:?}]",
        snapshot.record_key.as_deref().unwrap_or("<no key>").bold(),
        snapshot.phase
    );
    for field in &snapshot.fields {
        let line = match field.state {
            FieldState::Passed => format!("  {} {}", "✓".green(), field.label),
            FieldState::Active => format!("  {} {}", "▶".cyan(), field.label.bold()),
            FieldState::Failed => format!("  {} {}", "✗".red(), field.label.red()),
            FieldState::Pending => format!("  {} {}", "·".dim(), field.label),
        };
        out.push('\n');
        out.push_str(&line);
    }
    out
}
