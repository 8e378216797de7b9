//! The sink protocol: observers of interpretation events.
//!
//! A sink must handle `write` and `indent`; everything else — `call`,
//! `ret`, `jmp`, `terminate`, `shell` — is an optional capability with a
//! no-op default, so a sink that does not care about control flow simply
//! leaves them alone.  Missing hooks are never errors.  Each sink carries
//! one associated error type and any hook may fail; the interpreter stops
//! and propagates.

use std::io;
use std::io::Write;

/// An observer of interpretation events.
pub trait Sink {
    type Error;

    /// `bytes` of output followed by `nl` newlines.
    fn write(&mut self, bytes: &[u8], nl: usize) -> Result<(), Self::Error>;

    /// The start of a fresh output line at the given indent depth.
    fn indent(&mut self, columns: usize) -> Result<(), Self::Error>;

    /// A placeholder expansion begins.
    fn call(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// A block named `name` finished expanding.
    fn ret(&mut self, name: &[u8]) -> Result<(), Self::Error> {
        let _ = name;
        Ok(())
    }

    /// Control moved to the next chained segment at `address`.
    fn jmp(&mut self, address: u32) -> Result<(), Self::Error> {
        let _ = address;
        Ok(())
    }

    /// The program finished; `name` is the entry block's name.
    fn terminate(&mut self, name: &[u8]) -> Result<(), Self::Error> {
        let _ = name;
        Ok(())
    }

    /// A reserved shell filter was reached.
    fn shell(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

const SPACES: &[u8; 64] = &[b' '; 64];
const NEWLINES: &[u8; 16] = &[b'\n'; 16];

/// Writes tangled output verbatim to an underlying byte sink.
///
/// In file mode the sink appends the conventional final newline on
/// `terminate` (unless configured not to); in plain mode, used for tag
/// expansion to a console, output ends exactly where the program's last
/// write ended.
#[derive(Debug)]
pub struct StreamSink<W> {
    out: W,
    trailing_newline: bool,
}

impl<W: Write> StreamSink<W> {
    /// A sink that adds nothing of its own.
    pub fn plain(out: W) -> StreamSink<W> {
        StreamSink {
            out,
            trailing_newline: false,
        }
    }

    /// A sink for output files: ends the file with a newline unless `omit`.
    pub fn file(out: W, omit_trailing_newline: bool) -> StreamSink<W> {
        StreamSink {
            out,
            trailing_newline: !omit_trailing_newline,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn repeat(&mut self, pattern: &[u8], mut count: usize) -> io::Result<()> {
        while count > 0 {
            let chunk = count.min(pattern.len());
            self.out.write_all(&pattern[..chunk])?;
            count -= chunk;
        }
        Ok(())
    }
}

impl<W: Write> Sink for StreamSink<W> {
    type Error = io::Error;

    fn write(&mut self, bytes: &[u8], nl: usize) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.repeat(NEWLINES, nl)
    }

    fn indent(&mut self, columns: usize) -> io::Result<()> {
        self.repeat(SPACES, columns)
    }

    fn terminate(&mut self, _name: &[u8]) -> io::Result<()> {
        if self.trailing_newline {
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_sink_writes_exactly_what_it_is_given() {
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        sink.write(b"abc", 2).unwrap();
        sink.indent(4).unwrap();
        sink.write(b"x", 0).unwrap();
        sink.terminate(b"t").unwrap();
        assert_eq!(out, b"abc\n\n    x");
    }

    #[test]
    fn file_sink_appends_the_final_newline() {
        let mut out = Vec::new();
        let mut sink = StreamSink::file(&mut out, false);
        sink.write(b"abc", 0).unwrap();
        sink.terminate(b"t").unwrap();
        assert_eq!(out, b"abc\n");

        let mut out = Vec::new();
        let mut sink = StreamSink::file(&mut out, true);
        sink.write(b"abc", 0).unwrap();
        sink.terminate(b"t").unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn deep_indents_chunk_through_the_pattern() {
        let mut out = Vec::new();
        let mut sink = StreamSink::plain(&mut out);
        sink.indent(150).unwrap();
        assert_eq!(out.len(), 150);
        assert!(out.iter().all(|&byte| byte == b' '));
    }
}
