//! Log Relay: drains a worker's merged output into a [`LogSink`].
//!
//! Exactly one relay reads each worker's stream, so that worker's lines keep
//! their emission order. The relay ends when the stream reaches end-of-file,
//! which happens once the process (and anything holding its output) exits.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::log::LogSink;
use crate::{plog_debug, plog_warn};

/// The most recent lines of a worker's output, kept for failure diagnostics.
#[derive(Debug)]
pub struct OutputTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    closed: watch::Sender<bool>,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the relay has reached end-of-file.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Start the relay for one worker on the blocking pool.
pub fn spawn_relay<R>(
    model: String,
    output: R,
    sink: Arc<dyn LogSink>,
    tail: Arc<OutputTail>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        relay_lines(&model, output, sink.as_ref(), &tail);
    })
}

/// Forward every line of `output` to `sink` until end-of-file. Returns the
/// number of lines relayed.
///
/// Invalid UTF-8 is replaced rather than ending the relay.
pub fn relay_lines<R: Read>(
    model: &str,
    output: R,
    sink: &dyn LogSink,
    tail: &OutputTail,
) -> usize {
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    let mut count = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                sink.line(model, &line);
                tail.push(line);
                count += 1;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                plog_warn!("relay: output of {} unreadable: {}", model, e);
                break;
            }
        }
    }

    tail.close();
    plog_debug!("relay: {} stream closed after {} lines", model, count);
    count
}
