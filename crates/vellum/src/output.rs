//! Output sinks.
//!
//! Rendering streams through a [`TemplateWriter`]: the default in-memory
//! sink is a plain `String`, and any `std::io::Write` can be adapted with
//! [`IoWriter`] to stream without materializing the whole result.

use std::io;

use crate::error::Error;

/// The sink a render writes into.
pub trait TemplateWriter {
    /// Writes a string fragment.
    fn write_str(&mut self, s: &str) -> Result<(), Error>;

    /// Writes raw bytes. The default forwards lossy-decoded text to
    /// [`TemplateWriter::write_str`].
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_str(&String::from_utf8_lossy(bytes))
    }
}

impl TemplateWriter for String {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        self.push_str(s);
        Ok(())
    }
}

impl TemplateWriter for Vec<u8> {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        self.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Adapts any [`io::Write`] into a [`TemplateWriter`].
pub struct IoWriter<W: io::Write>(pub W);

impl<W: io::Write> TemplateWriter for IoWriter<W> {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        self.write_bytes(s.as_bytes())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.0
            .write_all(bytes)
            .map_err(|e| Error::new("execution", "write to output sink failed").with_cause(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_sink() {
        let mut out = String::new();
        out.write_str("ab").unwrap();
        out.write_str("cd").unwrap();
        assert_eq!(out, "abcd");
    }

    #[test]
    fn test_vec_sink() {
        let mut out = Vec::new();
        out.write_str("ab").unwrap();
        out.write_bytes(b"cd").unwrap();
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_io_writer() {
        let mut buf = Vec::new();
        {
            let mut sink = IoWriter(&mut buf);
            sink.write_str("streamed").unwrap();
        }
        assert_eq!(buf, b"streamed");
    }
}
