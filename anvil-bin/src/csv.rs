//! CSV event log.
//!
//! The first line is the header `event,timestamp,offset,expected,actual,delta_bits`.
//! `FLIP` rows fill exactly these columns. The other record types reuse the
//! leading columns:
//!
//! ```text
//! FLIP,<secs>.<nanos>,<offset>,<expected>,<actual>,<delta_bits>
//! ENTROPY,<secs>.<nanos>,<entropy>
//! REGION,<round>,<chunk>,<entropy>,<flip_count>
//! TRIPLET,<round>,<aggressor1>,<victim>,<aggressor2>,<flip_count>,<phys1>,<phys2>,<phys3>
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anvil_core::sink::{EventSink, LogRecord, SinkError};
use chrono::{DateTime, Local};

/// Column header of the event log.
pub const HEADER: &str = "event,timestamp,offset,expected,actual,delta_bits";

/// Writes [`LogRecord`]s as CSV rows.
pub struct CsvSink<W: Write> {
    writer: W,
}

impl CsvSink<BufWriter<File>> {
    /// Creates (or truncates) `path` and writes the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        CsvSink::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> CsvSink<W> {
    /// Wraps `writer` and writes the header.
    pub fn new(mut writer: W) -> Result<Self, SinkError> {
        writeln!(writer, "{}", HEADER)?;
        Ok(CsvSink { writer })
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn timestamp(ts: &DateTime<Local>) -> String {
    format!("{}.{:09}", ts.timestamp(), ts.timestamp_subsec_nanos())
}

impl<W: Write> EventSink for CsvSink<W> {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let event = record.event_type();
        match record {
            LogRecord::Flip(flip) => writeln!(
                self.writer,
                "{},{},0x{:x},0x{:02x},0x{:02x},{}",
                event,
                timestamp(&flip.timestamp),
                flip.offset,
                flip.expected,
                flip.actual,
                flip.delta_bits
            )?,
            LogRecord::Entropy {
                timestamp: ts,
                entropy,
            } => writeln!(self.writer, "{},{},{:.6}", event, timestamp(ts), entropy)?,
            LogRecord::Region {
                round,
                chunk,
                entropy,
                flip_count,
            } => writeln!(
                self.writer,
                "{},{},{},{:.6},{}",
                event, round, chunk, entropy, flip_count
            )?,
            LogRecord::Triplet {
                round,
                triplet,
                phys,
            } => writeln!(
                self.writer,
                "{},{},{},{},{},{},0x{:x},0x{:x},0x{:x}",
                event,
                round,
                triplet.aggressor1_index,
                triplet.victim_index,
                triplet.aggressor2_index,
                triplet.flip_count,
                phys[0],
                phys[1],
                phys[2]
            )?,
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
