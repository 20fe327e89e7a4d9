// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Line-oriented reader over a guest's serial console.
//!
//! Reads block until a full line or end of stream. There is no timeout, so a
//! guest that stops producing output stalls the caller.

use std::io;
use std::io::BufRead;
use std::io::Write;

/// Where echoed console lines go.
pub type Echo = Box<dyn Write + Send>;

/// How an echoed line is labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Narration {
    /// Echoed as-is. Used for the shell banner and the final drain.
    Plain,
    /// Echoed with an `OUT: ` prefix.
    Guest,
}

/// Returns `true` for bytes that survive sanitization: printable ASCII plus
/// tab, LF, CR, VT and FF.
fn is_printable(b: u8) -> bool {
    matches!(b, 0x20..=0x7e | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Drops every byte that is not printable ASCII.
pub fn sanitize(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|&b| is_printable(b))
        .map(char::from)
        .collect()
}

/// Reads sanitized lines from a console stream, optionally echoing them.
pub struct ConsoleReader<R> {
    inner: R,
    echo: Option<Echo>,
    buf: Vec<u8>,
}

impl<R: BufRead> ConsoleReader<R> {
    /// Wraps `inner`. Lines are echoed to `echo` if one is provided.
    pub fn new(inner: R, echo: Option<Echo>) -> Self {
        Self {
            inner,
            echo,
            buf: Vec::new(),
        }
    }

    /// Reads the next line, without its terminator.
    ///
    /// Returns `None` once the stream is closed. A final unterminated line is
    /// still returned.
    pub fn read_line(&mut self, narration: Narration) -> io::Result<Option<String>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        let mut line = sanitize(&self.buf);
        let len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(len);
        self.echo(narration, &line);
        Ok(Some(line))
    }

    /// Consumes the rest of the stream, echoing it plainly.
    ///
    /// Only call this after the producer has been terminated, otherwise it
    /// blocks for as long as the producer keeps the stream open.
    pub fn drain(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.inner.read_to_end(&mut self.buf)?;
        if let Some(echo) = &mut self.echo {
            let rest = sanitize(&self.buf);
            if let Err(err) = echo.write_all(rest.as_bytes()).and_then(|()| echo.flush()) {
                tracing::warn!(error = &err as &dyn std::error::Error, "failed to echo console output");
            }
        }
        Ok(())
    }

    fn echo(&mut self, narration: Narration, line: &str) {
        let Some(echo) = &mut self.echo else {
            return;
        };
        let prefix = match narration {
            Narration::Plain => "",
            Narration::Guest => "OUT: ",
        };
        // A broken echo sink should not abort provisioning.
        if let Err(err) = writeln!(echo, "{prefix}{line}").and_then(|()| echo.flush()) {
            tracing::warn!(error = &err as &dyn std::error::Error, "failed to echo console output");
        }
    }
}
