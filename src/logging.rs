//! Console logging.
//!
//! Workers, pool threads and forked processes all log to stdout. Each
//! event is formatted into its own buffer and written with a single
//! `write_all` while holding the process-wide [`ConsoleLock`], so lines
//! never interleave.

use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

static CONSOLE: OnceLock<ConsoleLock> = OnceLock::new();

/// Serializes writes to one output.
pub struct ConsoleLock {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleLock {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// The stdout lock, created on first use.
    pub fn global() -> &'static ConsoleLock {
        CONSOLE.get_or_init(|| ConsoleLock::new(Box::new(io::stdout())))
    }

    /// Write `bytes` without interleaving with other writers.
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(bytes)?;
        out.flush()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.out.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }

    pub fn make_writer(&self) -> EventBuffer<'_> {
        EventBuffer {
            console: self,
            buf: Vec::with_capacity(256),
        }
    }
}

/// One event's worth of output; written out when dropped.
pub struct EventBuffer<'a> {
    console: &'a ConsoleLock,
    buf: Vec<u8>,
}

impl Write for EventBuffer<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventBuffer<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let _ = self.console.write_all(&self.buf);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GlobalConsole;

impl<'a> MakeWriter<'a> for GlobalConsole {
    type Writer = EventBuffer<'static>;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleLock::global().make_writer()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
///
/// Calling it again is harmless; the first subscriber stays.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(GlobalConsole)
        .try_init();
}

/// Flush buffered console output. Called once the server has stopped.
pub fn flush() {
    if let Some(console) = CONSOLE.get() {
        let _ = console.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            // split writes so unserialized output would interleave
            let mut out = self.0.lock().unwrap();
            let n = bytes.len().min(3);
            out.extend_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_events_do_not_interleave() {
        let sink = Shared::default();
        let console = Arc::new(ConsoleLock::new(Box::new(sink.clone())));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let console = Arc::clone(&console);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let mut event = console.make_writer();
                        write!(event, "thread {t} ").unwrap();
                        writeln!(event, "line {i}").unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 200);
        for line in lines {
            let mut words = line.split(' ');
            assert_eq!(words.next(), Some("thread"));
            assert!(words.next().unwrap().parse::<u32>().is_ok());
            assert_eq!(words.next(), Some("line"));
            assert!(words.next().unwrap().parse::<u32>().unwrap() < 50);
        }
    }

    #[test]
    fn test_empty_event_writes_nothing() {
        let sink = Shared::default();
        let console = ConsoleLock::new(Box::new(sink.clone()));
        drop(console.make_writer());
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
