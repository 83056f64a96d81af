//! Interactive paste capture from a line-oriented reader (normally stdin).
//!
//! ```text
//! :paste fix greeting     start capturing, reason "fix greeting"
//! ...code...
//! :end                    submit the captured block
//! :quit                   stop reading
//! ```
//!
//! A line that starts like code (one of the configured prefixes) also starts
//! a capture, with that line included. End of input closes an open capture.
//!
//! Captures queue behind any attempt in progress. If that attempt commits and
//! restarts the process, queued pastes and unread input are lost.

use std::io::{self, BufRead};

use tracing::{debug, info};

use super::{CandidateFunnel, OfferError, RawCandidate};

const PASTE_CMD: &str = ":paste";
const END_CMD: &str = ":end";
const QUIT_CMD: &str = ":quit";
const DEFAULT_REASON: &str = "manual paste";

/// One captured block. The payload is kept as raw bytes; text checks
/// happen when it is offered to the funnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub payload: Vec<u8>,
    pub reason: String,
}

impl Capture {
    fn is_blank(&self) -> bool {
        self.payload.iter().all(u8::is_ascii_whitespace)
    }
}

pub struct PasteReader<R> {
    reader: R,
    prefixes: Vec<String>,
    done: bool,
}

impl<R: BufRead> PasteReader<R> {
    pub fn new(reader: R, prefixes: Vec<String>) -> Self {
        Self {
            reader,
            prefixes,
            done: false,
        }
    }

    /// Block until the next complete capture. `None` after `:quit` or end of input.
    pub fn next_capture(&mut self) -> io::Result<Option<Capture>> {
        let mut capture: Option<Capture> = None;
        while !self.done {
            let Some(line) = self.read_line()? else {
                self.done = true;
                break;
            };
            let command = String::from_utf8_lossy(&line).trim().to_string();
            match capture.as_mut() {
                Some(open) => {
                    if command == END_CMD {
                        if open.is_blank() {
                            debug!("discarding empty paste");
                            capture = None;
                            continue;
                        }
                        return Ok(capture);
                    }
                    open.payload.extend_from_slice(&line);
                }
                None => {
                    if command == QUIT_CMD {
                        self.done = true;
                    } else if let Some(rest) = strip_command(&command, PASTE_CMD) {
                        let reason = if rest.is_empty() { DEFAULT_REASON } else { rest };
                        capture = Some(Capture {
                            payload: Vec::new(),
                            reason: reason.to_string(),
                        });
                    } else if self.starts_like_code(&line) {
                        capture = Some(Capture {
                            payload: line,
                            reason: DEFAULT_REASON.to_string(),
                        });
                    } else if !command.is_empty() {
                        debug!(line = %command, "ignoring input outside a paste");
                    }
                }
            }
        }
        Ok(capture.filter(|open| !open.is_blank()))
    }

    fn starts_like_code(&self, line: &[u8]) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| line.starts_with(prefix.as_bytes()))
    }

    /// Next raw line, newline-terminated. Bytes are not decoded here so a
    /// non-UTF-8 paste is rejected as one candidate instead of ending input.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        Ok(Some(line))
    }
}

/// `:paste reason` -> `Some("reason")`; `:pasted` -> `None`.
fn strip_command<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(command)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Feed captures into `funnel` until `:quit`, end of input, or the queue closes.
pub fn run_paste_source<R: BufRead>(
    mut reader: PasteReader<R>,
    funnel: &CandidateFunnel,
) -> io::Result<()> {
    while let Some(capture) = reader.next_capture()? {
        info!(reason = %capture.reason, bytes = capture.payload.len(), "paste captured");
        let raw = RawCandidate::new(capture.payload, format!("paste: {}", capture.reason));
        match funnel.offer(raw) {
            Ok(()) | Err(OfferError::Malformed) => {}
            Err(OfferError::Closed) => break,
        }
    }
    info!("paste source finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CodeCandidate;
    use std::io::Cursor;

    fn reader(input: impl AsRef<[u8]>) -> PasteReader<Cursor<Vec<u8>>> {
        PasteReader::new(
            Cursor::new(input.as_ref().to_vec()),
            vec!["import ".to_string(), "def ".to_string()],
        )
    }

    #[test]
    fn explicit_paste_block_with_reason() {
        let mut paste = reader("hello\n:paste fix greeting\nprint('hi')\n\nprint('bye')\n:end\n");

        let capture = paste.next_capture().expect("read").expect("capture");
        assert_eq!(capture.reason, "fix greeting");
        assert_eq!(capture.payload, b"print('hi')\n\nprint('bye')\n");
        assert_eq!(paste.next_capture().expect("read"), None);
    }

    #[test]
    fn code_prefix_starts_capture_including_line() {
        let mut paste = reader("import os\nprint(os.getcwd())\n:end\n");

        let capture = paste.next_capture().expect("read").expect("capture");
        assert_eq!(capture.reason, DEFAULT_REASON);
        assert_eq!(capture.payload, b"import os\nprint(os.getcwd())\n");
    }

    #[test]
    fn end_of_input_closes_open_capture() {
        let mut paste = reader(":paste\ndef main():\n    pass");

        let capture = paste.next_capture().expect("read").expect("capture");
        assert_eq!(capture.reason, DEFAULT_REASON);
        assert_eq!(capture.payload, b"def main():\n    pass\n");
        assert_eq!(paste.next_capture().expect("read"), None);
    }

    #[test]
    fn quit_stops_reading() {
        let mut paste = reader(":quit\n:paste\nx = 1\n:end\n");
        assert_eq!(paste.next_capture().expect("read"), None);
        assert_eq!(paste.next_capture().expect("read"), None);
    }

    #[test]
    fn quit_inside_capture_is_payload() {
        let mut paste = reader(":paste\n:quit\n:end\n");
        let capture = paste.next_capture().expect("read").expect("capture");
        assert_eq!(capture.payload, b":quit\n");
    }

    #[test]
    fn empty_capture_is_dropped() {
        let mut paste = reader(":paste\n\n   \n");
        assert_eq!(paste.next_capture().expect("read"), None);
    }

    #[test]
    fn similar_commands_are_not_confused() {
        assert_eq!(strip_command(":paste", PASTE_CMD), Some(""));
        assert_eq!(strip_command(":paste  why", PASTE_CMD), Some("why"));
        assert_eq!(strip_command(":pasted", PASTE_CMD), None);
    }

    #[test]
    fn run_paste_source_queues_each_capture() {
        let (funnel, rx) = super::super::channel();
        let paste = reader(":paste one\necho 1\n:end\n:paste\n   \n:end\n:paste two\necho 2\n:end\n");

        run_paste_source(paste, &funnel).expect("run");
        drop(funnel);

        let provenances: Vec<String> = rx.iter().map(|c| c.provenance().to_string()).collect();
        assert_eq!(provenances, vec!["paste: one", "paste: two"]);
    }

    #[test]
    fn non_utf8_paste_is_dropped_and_reading_continues() {
        let (funnel, rx) = super::super::channel();
        let paste = reader(&b":paste bad\n\xff\xfe\n:end\n:paste good\necho ok\n:end\n"[..]);

        run_paste_source(paste, &funnel).expect("run");
        drop(funnel);

        let queued: Vec<CodeCandidate> = rx.iter().collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].provenance(), "paste: good");
        assert_eq!(queued[0].payload(), "echo ok\n");
    }

    #[test]
    fn non_utf8_capture_keeps_raw_bytes() {
        let mut paste = reader(&b":paste\n\xff\xfe\n:end\n"[..]);
        let capture = paste.next_capture().expect("read").expect("capture");
        assert_eq!(capture.payload, b"\xff\xfe\n");
    }

    #[test]
    fn default_prefixes_trigger_on_from_import() {
        let prefixes = crate::io::config::ExportConfig::default().block_prefixes;
        let mut paste = PasteReader::new(
            Cursor::new(b"from os import path\nprint(path.sep)\n:end\n".to_vec()),
            prefixes,
        );

        let capture = paste.next_capture().expect("read").expect("capture");
        assert_eq!(capture.payload, b"from os import path\nprint(path.sep)\n");
    }
}
