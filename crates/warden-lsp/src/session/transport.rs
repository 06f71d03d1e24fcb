//! Stdio transport layer with LSP header framing.
//!
//! LSP uses a simple framing protocol over stdio:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//!
//! Reading and writing are split so the session's reader thread owns the
//! server's stdout while callers share the writer.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};

use crate::errors::TransportError;

/// Reads LSP-framed messages from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a readable stream.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Receives an LSP-framed message (blocks until complete).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::MissingContentLength` if no Content-Length header is found.
    /// Returns `TransportError::Io` if reading fails or the stream closes.
    pub fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let content_length = self.read_headers()?;
        let mut content = vec![0u8; content_length];
        self.reader.read_exact(&mut content)?;
        Ok(content)
    }

    /// Reads headers and extracts the Content-Length value.
    fn read_headers(&mut self) -> Result<usize, TransportError> {
        let mut content_length: Option<usize> = None;

        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line)?;
            if bytes_read == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed while reading headers",
                )));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Empty line marks end of headers
                break;
            }

            if let Some(value) = trimmed.strip_prefix("Content-Length:") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| TransportError::InvalidHeader)?,
                );
            }
            // Ignore other headers (e.g., Content-Type)
        }

        content_length.ok_or(TransportError::MissingContentLength)
    }
}

/// Writes LSP-framed messages to a byte stream.
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps a writable stream.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Sends an LSP-framed message.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if writing to the process fails.
    pub fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let header = format!("Content-Length: {}\r\n\r\n", message.len());
        self.writer.write_all(header.as_bytes())?;
        self.writer.write_all(message)?;
        self.writer.flush()?;
        Ok(())
    }
}
