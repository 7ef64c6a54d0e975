use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(sk-[A-Za-z0-9_-]{16,}|Bearer\s+[^\s"]+|eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+)"#
    )
    .expect("Invalid redaction regex");
}

/// Masks provider keys, bearer headers and raw JWTs in an already formatted log line.
pub fn redact_line(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact_line(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_keys_and_tokens() {
        let line = r#"{"msg":"calling with Bearer abc.def and sk-ABCDEFGHIJKLMNOPQRST"}"#;
        let out = redact_line(line);
        assert!(!out.contains("abc.def"));
        assert!(!out.contains("sk-ABCDEFGHIJKLMNOPQRST"));
        assert!(out.contains("calling with"));
    }

    #[test]
    fn test_writer_passes_plain_text() {
        let mut buf = Vec::new();
        {
            let mut w = RedactingWriter::new(&mut buf);
            w.write_all(b"plain line\n").unwrap();
        }
        assert_eq!(buf, b"plain line\n");
    }

    #[test]
    fn test_redacts_raw_jwt() {
        let out = redact_line("token=eyJhbGciOi.eyJzdWIiOi.c2lnbmF0dXJl end");
        assert_eq!(out, "token=[REDACTED] end");
    }
}
