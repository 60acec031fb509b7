//! Stdin-backed landmark frame source.
//!
//! The pose-estimation model runs out of process and pipes one JSON frame
//! per line into the agent. A reader thread parses lines and forwards frames
//! over a bounded channel; malformed lines are counted and dropped, never
//! fatal.

use crate::source::types::LandmarkFrame;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Errors that can occur while running a frame source.
#[derive(Debug)]
pub enum SourceError {
    AlreadyRunning,
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::AlreadyRunning => write!(f, "Frame source is already running"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Reads JSON-lines landmark frames from stdin on a background thread.
pub struct StdinFrameSource {
    sender: Sender<LandmarkFrame>,
    receiver: Receiver<LandmarkFrame>,
    running: Arc<AtomicBool>,
    rejected_lines: Arc<AtomicU64>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl StdinFrameSource {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(10_000);
        Self {
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            rejected_lines: Arc::new(AtomicU64::new(0)),
            reader_thread: None,
        }
    }

    /// Start the reader thread.
    pub fn start(&mut self) -> Result<(), SourceError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SourceError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        let sender = self.sender.clone();
        let running = self.running.clone();
        let rejected = self.rejected_lines.clone();

        self.reader_thread = Some(thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let line = match line {
                    Ok(l) => l,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LandmarkFrame>(&line) {
                    Ok(frame) => {
                        // A full channel means the pipeline is stalled; shed
                        // the frame rather than block the producer.
                        if sender.try_send(frame).is_err() {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("rejected malformed frame line: {e}");
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        }));

        Ok(())
    }

    /// Stop accepting frames. The reader thread exits on the next line.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver for parsed frames.
    pub fn receiver(&self) -> &Receiver<LandmarkFrame> {
        &self.receiver
    }

    /// Number of lines dropped as malformed or shed under backpressure.
    pub fn rejected_lines(&self) -> u64 {
        self.rejected_lines.load(Ordering::Relaxed)
    }
}

impl Default for StdinFrameSource {
    fn default() -> Self {
        Self::new()
    }
}
