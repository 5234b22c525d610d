use std::io::{self, Write};

use crate::{diag::Printer, verify::Finding};

/// One JSON object per line
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPrinter;

impl Printer for JsonPrinter {
    fn print(&self, out: &mut dyn Write, finding: &Finding) -> io::Result<()> {
        serde_json::to_writer(&mut *out, finding)?;
        out.write_all(b"\n")
    }
}
