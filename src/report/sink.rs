use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};

use crate::config::{Config, ReportEncoding};
use crate::error::EngineError;

/// Capacity of a single report message, terminator included.
pub const MAX_MESSAGE: usize = 5120;

/// A fixed-capacity, NUL-terminated text buffer.
///
/// Text past `N - 1` bytes is dropped at a character boundary and the buffer
/// is flagged as truncated. Writing never fails.
pub struct BoundedMessage<const N: usize = MAX_MESSAGE> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> BoundedMessage<N> {
    pub const fn new() -> Self {
        const { assert!(N > 0, "a message needs room for its terminator") };
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    /// The text followed by its NUL terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl<const N: usize> Default for BoundedMessage<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for BoundedMessage<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - 1 - self.len;
        let mut take = s.len().min(room);
        if take < s.len() {
            self.truncated = true;
            while !s.is_char_boundary(take) {
                take -= 1;
            }
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        self.buf[self.len] = 0;
        Ok(())
    }
}

/// Where report text goes: an optional file or writer, and the debugger.
///
/// On Windows the debugger channel is `OutputDebugString`; elsewhere it is
/// standard error.
pub struct ReportSink {
    writer: Option<Box<dyn Write + Send>>,
    to_debugger: bool,
    encoding: ReportEncoding,
    write_failed: bool,
}

impl ReportSink {
    pub fn new(to_debugger: bool, encoding: ReportEncoding) -> Self {
        Self {
            writer: None,
            to_debugger,
            encoding,
            write_failed: false,
        }
    }

    /// Builds the sink described by `config`, creating the report file.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let mut sink = Self::new(config.report_to_debugger, config.report_encoding);
        if let Some(path) = &config.report_file {
            let file = File::create(path)?;
            sink.set_writer(Box::new(BufWriter::new(file)));
        }
        Ok(sink)
    }

    /// Sends report text to `writer` from now on, replacing any report file.
    pub fn set_writer(&mut self, writer: Box<dyn Write + Send>) {
        self.writer = Some(writer);
        self.write_failed = false;
    }

    pub fn encoding(&self) -> ReportEncoding {
        self.encoding
    }

    /// Formats and emits one message.
    pub fn report(&mut self, args: fmt::Arguments<'_>) {
        let mut message = BoundedMessage::<MAX_MESSAGE>::new();
        let _ = fmt::write(&mut message, args);
        self.emit(&message);
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.flush() {
                tracing::warn!("failed to flush the leak report: {err}");
            }
        }
    }

    fn emit<const N: usize>(&mut self, message: &BoundedMessage<N>) {
        if let Some(writer) = self.writer.as_mut() {
            let result = match self.encoding {
                ReportEncoding::Ascii => writer.write_all(message.as_str().as_bytes()),
                ReportEncoding::Unicode => {
                    let bytes: Vec<u8> = message
                        .as_str()
                        .encode_utf16()
                        .flat_map(u16::to_le_bytes)
                        .collect();
                    writer.write_all(&bytes)
                }
            };
            if let Err(err) = result {
                if !self.write_failed {
                    self.write_failed = true;
                    tracing::warn!("failed to write the leak report: {err}");
                }
            }
        }

        if self.to_debugger {
            debugger_output(message, self.encoding);
        }
    }
}

#[cfg(windows)]
fn debugger_output<const N: usize>(message: &BoundedMessage<N>, encoding: ReportEncoding) {
    use windows::Win32::System::Diagnostics::Debug::{OutputDebugStringA, OutputDebugStringW};
    use windows::core::{PCSTR, PCWSTR};

    match encoding {
        ReportEncoding::Ascii => {
            // SAFETY: the buffer is NUL terminated.
            unsafe { OutputDebugStringA(PCSTR(message.as_bytes_with_nul().as_ptr())) };
        }
        ReportEncoding::Unicode => {
            let wide: Vec<u16> = message.as_str().encode_utf16().chain([0]).collect();
            // SAFETY: `wide` is NUL terminated and outlives the call.
            unsafe { OutputDebugStringW(PCWSTR(wide.as_ptr())) };
        }
    }
}

#[cfg(not(windows))]
fn debugger_output<const N: usize>(message: &BoundedMessage<N>, _encoding: ReportEncoding) {
    let _ = std::io::stderr().write_all(message.as_str().as_bytes());
}
