//! Human-readable progress lines for a copy.

use std::io::Write;

use parking_lot::Mutex;

/// Writes progress lines to an optional sink; a `None` sink discards them.
pub struct Reporter {
    sink: Option<Mutex<Box<dyn Write + Send>>>,
}

impl Reporter {
    pub fn new(sink: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            sink: sink.map(Mutex::new),
        }
    }

    /// A reporter that prints nothing.
    pub fn silent() -> Self {
        Self { sink: None }
    }

    pub fn line(&self, message: &str) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut sink = sink.lock();
        // Best effort: a closed sink does not fail the copy.
        let _ = writeln!(sink, "{message}");
        let _ = sink.flush();
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Write;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// A `Write` that appends into shared memory.
    #[derive(Clone, Default)]
    pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).to_string()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SharedBuffer;
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_reporter_writes_lines() {
        let buffer = SharedBuffer::default();
        let reporter = Reporter::new(Some(Box::new(buffer.clone())));
        reporter.line("Copying config sha256:abc");
        reporter.line("Writing manifest to image destination");
        let out = buffer.contents();
        assert_eq!(
            out,
            "Copying config sha256:abc\nWriting manifest to image destination\n"
        );
    }

    #[test]
    fn test_silent_reporter() {
        Reporter::silent().line("ignored");
    }
}
