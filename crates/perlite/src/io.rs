use std::io::{self, Write as _};

/// Trait for handling output from `print`, `say`, and `warn`.
///
/// Implement this trait to capture or redirect output from executed code.
/// The default implementation `StdPrint` writes to the process streams.
pub trait PrintWriter: Send {
    /// Writes a chunk of standard-output text, with no added separators.
    fn write_out(&mut self, text: &str);

    /// Writes a chunk of standard-error text (used by `warn` and verbose
    /// eval diagnostics).
    fn write_err(&mut self, text: &str);
}

/// Default `PrintWriter` that writes to stdout/stderr.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_out(&mut self, text: &str) {
        let _ = io::stdout().write_all(text.as_bytes());
    }

    fn write_err(&mut self, text: &str) {
        let _ = io::stderr().write_all(text.as_bytes());
    }
}

/// A `PrintWriter` that collects output into strings.
///
/// Useful for testing or capturing output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    out: String,
    err: String,
}

impl CollectStringPrint {
    /// Creates a new empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected stdout text.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.out
    }

    /// Returns the collected stderr text.
    #[must_use]
    pub fn errors(&self) -> &str {
        &self.err
    }

    /// Consumes the writer and returns the collected stdout text.
    #[must_use]
    pub fn into_output(self) -> String {
        self.out
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_out(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn write_err(&mut self, text: &str) {
        self.err.push_str(text);
    }
}

/// `PrintWriter` that ignores all output.
///
/// Useful for suppressing output during testing or benchmarking.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_out(&mut self, _text: &str) {}

    fn write_err(&mut self, _text: &str) {}
}
