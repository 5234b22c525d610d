//! Where findings go. A [`Sink`] owns the output stream and a [`Printer`]
//! that renders one finding per record.

mod json;
mod text;

use std::{
    io::{self, Write},
    sync::Mutex,
};

use log::error;

use crate::verify::{Category, Finding, Severity};

pub use json::JsonPrinter;
pub use text::TextPrinter;

/// Renders a single finding. Implementations write the whole record, trailing
/// newline included.
pub trait Printer: Send + Sync {
    fn print(&self, out: &mut dyn Write, finding: &Finding) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Text,
    Json,
}

impl Format {
    /// `json` (any case) selects JSON lines, everything else is text
    pub fn from_selector(selector: &str) -> Self {
        if selector.trim().eq_ignore_ascii_case("json") {
            Format::Json
        } else {
            Format::Text
        }
    }

    pub fn printer(self) -> Box<dyn Printer> {
        match self {
            Format::Text => Box::new(TextPrinter),
            Format::Json => Box::new(JsonPrinter),
        }
    }
}

pub struct Sink {
    printer: Box<dyn Printer>,
    out: Mutex<Box<dyn Write + Send>>,
    terminate_at: Option<Severity>,
}

impl Sink {
    /// `terminate_at` is the lowest severity of a memory-safety finding that
    /// should end the process. `None` never terminates.
    pub fn new(format: Format, out: Box<dyn Write + Send>, terminate_at: Option<Severity>) -> Self {
        Self {
            printer: format.printer(),
            out: Mutex::new(out),
            terminate_at,
        }
    }

    pub fn stderr(format: Format, terminate_at: Option<Severity>) -> Self {
        Self::new(format, Box::new(io::stderr()), terminate_at)
    }

    /// Write and flush one finding. Returns whether the finding calls for
    /// termination; acting on that is up to the caller, once it has released
    /// its own locks.
    pub fn emit(&self, finding: &Finding) -> bool {
        let mut record = Vec::with_capacity(128);
        if let Err(err) = self.printer.print(&mut record, finding) {
            error!("could not render finding {:?}: {err}", finding.kind);
        } else {
            let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(err) = out.write_all(&record).and_then(|()| out.flush()) {
                error!("could not write finding {:?}: {err}", finding.kind);
            }
        }
        self.should_terminate(finding)
    }

    pub fn should_terminate(&self, finding: &Finding) -> bool {
        match self.terminate_at {
            Some(threshold) => {
                finding.category() == Category::MemorySafety && finding.severity >= threshold
            }
            None => false,
        }
    }

    pub fn flush(&self) {
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = out.flush() {
            error!("could not flush findings: {err}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::verify::FindingKind;

    /// A writer whose contents can be read back while the sink owns it
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn selector_picks_json_only_when_asked() {
        assert_eq!(Format::from_selector("json"), Format::Json);
        assert_eq!(Format::from_selector(" JSON "), Format::Json);
        assert_eq!(Format::from_selector("text"), Format::Text);
        assert_eq!(Format::from_selector(""), Format::Text);
    }

    #[test]
    fn emit_writes_whole_records() {
        let buf = SharedBuf::default();
        let sink = Sink::new(Format::Text, Box::new(buf.clone()), None);
        assert!(!sink.emit(&Finding::new(FindingKind::WildPointer, "first")));
        assert!(!sink.emit(&Finding::new(FindingKind::UseAfterFree, "second")));
        let contents = buf.contents();
        assert!(contents.contains("first"));
        assert!(contents.ends_with('\n'));
        assert!(contents.find("first") < contents.find("second"));
    }

    #[test]
    fn only_memory_safety_findings_terminate() {
        let sink = Sink::new(Format::Text, Box::new(io::sink()), Some(Severity::Warning));
        assert!(sink.should_terminate(&Finding::new(FindingKind::WildPointer, "")));
        assert!(sink.should_terminate(&Finding::new(FindingKind::OutOfBounds, "")));
        assert!(!sink.should_terminate(&Finding::new(FindingKind::UnmatchedEndEvent, "")));
        assert!(!sink.should_terminate(&Finding::new(FindingKind::Leak, "")));

        let errors_only = Sink::new(Format::Text, Box::new(io::sink()), Some(Severity::Error));
        assert!(!errors_only.should_terminate(&Finding::new(FindingKind::WildPointer, "")));
        assert!(errors_only.should_terminate(&Finding::new(FindingKind::DoubleFree, "")));
    }
}
