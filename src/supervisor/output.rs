//! Multiplexing of child output onto one console.
//!
//! Every service writes stdout and stderr into a single pipe. One blocking
//! reader per pipe forwards complete lines, tagged with the service, into a
//! shared channel drained by a single writer task. Lines from one service keep
//! their order; lines from different services interleave freely.

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bound on lines buffered between the readers and the console.
pub const LINE_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Position of the service in the session, used to pick a tag color.
    pub slot: usize,
    pub service: Arc<str>,
    pub line: String,
}

impl OutputLine {
    /// `[name    ] text`, the way lines appear on the console.
    pub fn tagged(&self) -> String {
        format!("[{:8}] {}", self.service, self.line)
    }
}

/// Destination of tagged child output.
pub trait LineSink: Send + Sync {
    fn emit(&self, line: &OutputLine);
}

/// Sink that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<OutputLine>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<OutputLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines of one service, in arrival order.
    pub fn lines_of(&self, service: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| &*l.service == service)
            .map(|l| l.line)
            .collect()
    }
}

impl LineSink for MemorySink {
    fn emit(&self, line: &OutputLine) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.clone());
        }
    }
}

/// Start the single writer task. It finishes once every sender is dropped.
pub fn spawn_multiplexer(
    sink: Arc<dyn LineSink>,
) -> (mpsc::Sender<OutputLine>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OutputLine>(LINE_BUFFER);
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            sink.emit(&line);
        }
    });
    (tx, handle)
}

/// Forward lines from `reader` until end of stream on a blocking thread.
pub fn spawn_reader<R>(
    slot: usize,
    service: Arc<str>,
    reader: R,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || forward_lines(slot, service, reader, tx))
}

fn forward_lines<R: Read>(slot: usize, service: Arc<str>, reader: R, tx: mpsc::Sender<OutputLine>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = OutputLine {
                    slot,
                    service: Arc::clone(&service),
                    line: text.trim_end_matches(['\n', '\r']).to_string(),
                };
                if tx.blocking_send(line).is_err() {
                    // console gone; keep draining so the child never blocks on a full pipe
                    debug!("{service} output dropped: console closed");
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading {service} output: {e}");
                break;
            }
        }
    }
    debug!("{service} output stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_line_pads_service_name() {
        let line = OutputLine {
            slot: 0,
            service: Arc::from("api"),
            line: "listening".into(),
        };
        assert_eq!(line.tagged(), "[api     ] listening");
    }

    #[tokio::test]
    async fn forwards_lines_in_order_with_tags() {
        let sink = Arc::new(MemorySink::default());
        let (tx, mux) = spawn_multiplexer(sink.clone());

        let input: &[u8] = b"first\nsecond\r\nno newline at end";
        spawn_reader(0, Arc::from("backend"), input, tx.clone())
            .await
            .unwrap();
        drop(tx);
        mux.await.unwrap();

        assert_eq!(
            sink.lines_of("backend"),
            vec!["first", "second", "no newline at end"]
        );
        assert!(sink.lines().iter().all(|l| l.slot == 0));
    }

    #[tokio::test]
    async fn keeps_per_service_order_across_interleaving() {
        let sink = Arc::new(MemorySink::default());
        let (tx, mux) = spawn_multiplexer(sink.clone());

        let a: Vec<u8> = (0..200).map(|i| format!("a{i}\n")).collect::<String>().into_bytes();
        let b: Vec<u8> = (0..200).map(|i| format!("b{i}\n")).collect::<String>().into_bytes();
        let ra = spawn_reader(0, Arc::from("a"), std::io::Cursor::new(a), tx.clone());
        let rb = spawn_reader(1, Arc::from("b"), std::io::Cursor::new(b), tx.clone());
        ra.await.unwrap();
        rb.await.unwrap();
        drop(tx);
        mux.await.unwrap();

        let expected_a: Vec<String> = (0..200).map(|i| format!("a{i}")).collect();
        let expected_b: Vec<String> = (0..200).map(|i| format!("b{i}")).collect();
        assert_eq!(sink.lines_of("a"), expected_a);
        assert_eq!(sink.lines_of("b"), expected_b);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let sink = Arc::new(MemorySink::default());
        let (tx, mux) = spawn_multiplexer(sink.clone());
        let input: &[u8] = b"ok\n\xff\xfe\nstill here\n";
        spawn_reader(2, Arc::from("vite"), input, tx.clone())
            .await
            .unwrap();
        drop(tx);
        mux.await.unwrap();

        let lines = sink.lines_of("vite");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "still here");
    }
}
