use std::io::{self, Write};

use crate::{diag::Printer, verify::Finding};

/// The human-readable report, one block per finding:
///
/// ```plaintext
/// [piverify] error: use after free in piextUSMEnqueueMemset (id 5)
///   `ptr` = 0x1010 points into USM memory that was already freed
///   argument: ptr
///   address: 0x1010
///   called from: main at app.cpp:12:5
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct TextPrinter;

impl Printer for TextPrinter {
    fn print(&self, out: &mut dyn Write, finding: &Finding) -> io::Result<()> {
        write!(out, "[piverify] {}: {}", finding.severity, finding.kind.title())?;
        match (&finding.function, finding.function_id) {
            (Some(name), Some(id)) => write!(out, " in {name} (id {id})")?,
            (None, Some(id)) => write!(out, " in function id {id}")?,
            _ => {}
        }
        writeln!(out)?;
        writeln!(out, "  {}", finding.message)?;
        if let Some(argument) = &finding.argument {
            writeln!(out, "  argument: {argument}")?;
        }
        if let Some(address) = finding.address {
            writeln!(out, "  address: {address:#x}")?;
        }
        if let Some(location) = &finding.location {
            writeln!(out, "  called from: {location}")?;
        }
        Ok(())
    }
}
