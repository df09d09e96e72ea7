//! Line-oriented activity source.
//!
//! An editor integration pipes one JSON-encoded [`ActivityEvent`] per line
//! into the agent. A reader thread parses the lines and hands the events
//! over a bounded channel to the producer loop.

use crate::activity::types::ActivityEvent;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Channel capacity between the reader thread and the producer loop.
const CHANNEL_CAPACITY: usize = 10_000;

/// Errors that can occur while starting a source.
#[derive(Debug)]
pub enum SourceError {
    AlreadyRunning,
    Spawn(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::AlreadyRunning => write!(f, "Activity source is already running"),
            SourceError::Spawn(e) => write!(f, "Could not spawn reader thread: {e}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Reads newline-delimited JSON activity events from any buffered reader.
pub struct LineSource<R> {
    reader: Option<R>,
    sender: Option<Sender<ActivityEvent>>,
    receiver: Receiver<ActivityEvent>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl LineSource<std::io::BufReader<std::io::Stdin>> {
    /// Source reading from the process's standard input.
    pub fn stdin() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()))
    }
}

impl<R> LineSource<R>
where
    R: BufRead + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        Self {
            reader: Some(reader),
            sender: Some(sender),
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Start the reader thread.
    ///
    /// The channel disconnects once the reader hits end of input.
    pub fn start(&mut self) -> Result<(), SourceError> {
        let (reader, sender) = match (self.reader.take(), self.sender.take()) {
            (Some(reader), Some(sender)) => (reader, sender),
            _ => return Err(SourceError::AlreadyRunning),
        };

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("activity-reader".to_string())
            .spawn(move || {
                read_lines(reader, &sender, &running);
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| SourceError::Spawn(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Ask the reader thread to stop after the current line.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver for parsed events.
    pub fn receiver(&self) -> &Receiver<ActivityEvent> {
        &self.receiver
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<ActivityEvent> {
        self.receiver.try_recv().ok()
    }
}

fn read_lines<R: BufRead>(reader: R, sender: &Sender<ActivityEvent>, running: &AtomicBool) {
    for (lineno, line) in reader.lines().enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("activity input closed: {e}");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<ActivityEvent>(trimmed) {
            Ok(event) => {
                if sender.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(line = lineno + 1, "ignoring unparseable activity line: {e}");
            }
        }
    }
}
