//! Per-task output capture
//!
//! Each task owns its sink; concurrent captured runs share nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Longest line kept; further characters of the line are dropped
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Console {
    Stdout,
    Stderr,
}

/// One completed line of program output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub console: Console,
    pub line: String,
    /// When the first byte of the line was written
    pub timestamp: DateTime<Utc>,
    pub thread: usize,
}

#[derive(Debug, Default)]
struct PartialLine {
    text: String,
    started: Option<(DateTime<Utc>, usize)>,
}

#[derive(Debug)]
struct CaptureState {
    lines: Vec<OutputLine>,
    stdout: PartialLine,
    stderr: PartialLine,
    truncated: usize,
    shutting_down: bool,
}

/// Buffered capture for one task
#[derive(Debug)]
pub struct CapturedOutput {
    max_lines: usize,
    state: Mutex<CaptureState>,
}

impl CapturedOutput {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            state: Mutex::new(CaptureState {
                lines: Vec::new(),
                stdout: PartialLine::default(),
                stderr: PartialLine::default(),
                truncated: 0,
                shutting_down: false,
            }),
        }
    }

    /// Append `text` written by `thread`. Writes after shutdown are dropped,
    /// as are characters once the line cap is reached.
    pub fn write(&self, console: Console, text: &str, thread: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutting_down {
            return;
        }
        for c in text.chars() {
            match c {
                '\r' => {}
                '\n' => {
                    let partial = match console {
                        Console::Stdout => &mut state.stdout,
                        Console::Stderr => &mut state.stderr,
                    };
                    let line = std::mem::take(&mut partial.text);
                    let (timestamp, thread) = partial.started.take().unwrap_or((Utc::now(), thread));
                    state.push(self.max_lines, console, line, timestamp, thread);
                }
                c => {
                    if state.truncated > 0 || state.lines.len() >= self.max_lines {
                        continue;
                    }
                    let partial = match console {
                        Console::Stdout => &mut state.stdout,
                        Console::Stderr => &mut state.stderr,
                    };
                    if partial.text.len() + c.len_utf8() > MAX_LINE_BYTES {
                        continue;
                    }
                    if partial.started.is_none() {
                        partial.started = Some((Utc::now(), thread));
                    }
                    partial.text.push(c);
                }
            }
        }
    }

    /// Stop accepting output
    pub fn shut_down(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutting_down = true;
    }

    /// Captured lines and the number of dropped lines. Incomplete lines are
    /// flushed unless something was already truncated.
    pub fn finish(&self) -> (Vec<OutputLine>, usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutting_down = true;
        if state.truncated == 0 {
            for console in [Console::Stdout, Console::Stderr] {
                let partial = match console {
                    Console::Stdout => &mut state.stdout,
                    Console::Stderr => &mut state.stderr,
                };
                if let Some((timestamp, thread)) = partial.started.take() {
                    let line = std::mem::take(&mut partial.text);
                    state.push(self.max_lines, console, line, timestamp, thread);
                }
            }
        }
        (std::mem::take(&mut state.lines), state.truncated)
    }
}

impl CaptureState {
    fn push(
        &mut self,
        max_lines: usize,
        console: Console,
        line: String,
        timestamp: DateTime<Utc>,
        thread: usize,
    ) {
        if self.lines.len() >= max_lines {
            self.truncated += 1;
            return;
        }
        self.lines.push(OutputLine {
            console,
            line,
            timestamp,
            thread,
        });
    }
}

/// Where a task's output goes
#[derive(Debug, Clone)]
pub enum OutputSink {
    Captured(Arc<CapturedOutput>),
    /// Pass through to the host's standard streams
    Console,
}

impl OutputSink {
    pub fn write(&self, console: Console, text: &str, thread: usize) {
        match self {
            OutputSink::Captured(capture) => capture.write(console, text, thread),
            OutputSink::Console => match console {
                Console::Stdout => {
                    let mut out = std::io::stdout().lock();
                    let _ = out.write_all(text.as_bytes());
                    let _ = out.flush();
                }
                Console::Stderr => {
                    let mut err = std::io::stderr().lock();
                    let _ = err.write_all(text.as_bytes());
                }
            },
        }
    }

    pub fn shut_down(&self) {
        if let OutputSink::Captured(capture) = self {
            capture.shut_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_on_newline_and_ignore_cr() {
        let capture = CapturedOutput::new(10);
        capture.write(Console::Stdout, "Hel", 0);
        capture.write(Console::Stdout, "lo\r\nWorld\n", 0);
        let (lines, truncated) = capture.finish();
        assert_eq!(truncated, 0);
        let text: Vec<_> = lines.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(text, vec!["Hello", "World"]);
    }

    #[test]
    fn test_streams_buffer_independently() {
        let capture = CapturedOutput::new(10);
        capture.write(Console::Stdout, "out", 0);
        capture.write(Console::Stderr, "err\n", 1);
        capture.write(Console::Stdout, "put\n", 0);
        let (lines, _) = capture.finish();
        assert_eq!(lines[0].console, Console::Stderr);
        assert_eq!(lines[0].line, "err");
        assert_eq!(lines[0].thread, 1);
        assert_eq!(lines[1].line, "output");
        assert!(lines[1].timestamp <= lines[0].timestamp);
    }

    #[test]
    fn test_truncation_counts_dropped_lines() {
        let capture = CapturedOutput::new(2);
        for i in 0..5 {
            capture.write(Console::Stdout, &format!("{}\n", i), 0);
        }
        capture.write(Console::Stdout, "partial", 0);
        let (lines, truncated) = capture.finish();
        assert_eq!(lines.len(), 2);
        assert_eq!(truncated, 3);
    }

    #[test]
    fn test_no_buffering_once_lines_are_full() {
        let capture = CapturedOutput::new(1);
        capture.write(Console::Stdout, "a\nb\n", 0);
        let chunk = "x".repeat(10_000);
        for _ in 0..1000 {
            capture.write(Console::Stdout, &chunk, 0);
            capture.write(Console::Stderr, &chunk, 0);
        }
        {
            let state = capture.state.lock().unwrap();
            assert_eq!(state.stdout.text.len(), 0);
            assert_eq!(state.stderr.text.len(), 0);
        }
        let (lines, truncated) = capture.finish();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "a");
        assert_eq!(truncated, 1);
    }

    #[test]
    fn test_long_line_is_capped() {
        let capture = CapturedOutput::new(10);
        let chunk = "y".repeat(10_000);
        for _ in 0..100 {
            capture.write(Console::Stdout, &chunk, 0);
        }
        assert_eq!(capture.state.lock().unwrap().stdout.text.len(), MAX_LINE_BYTES);
        capture.write(Console::Stdout, "\nnext\n", 0);
        let (lines, truncated) = capture.finish();
        assert_eq!(truncated, 0);
        assert_eq!(lines[0].line.len(), MAX_LINE_BYTES);
        assert_eq!(lines[1].line, "next");
    }

    #[test]
    fn test_incomplete_line_flushed_at_finish() {
        let capture = CapturedOutput::new(10);
        capture.write(Console::Stdout, "no newline", 2);
        let (lines, _) = capture.finish();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "no newline");
        assert_eq!(lines[0].thread, 2);
    }

    #[test]
    fn test_writes_after_shutdown_discarded() {
        let capture = CapturedOutput::new(10);
        capture.write(Console::Stdout, "before\n", 0);
        capture.shut_down();
        capture.write(Console::Stdout, "after\n", 0);
        let (lines, _) = capture.finish();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "before");
    }
}
