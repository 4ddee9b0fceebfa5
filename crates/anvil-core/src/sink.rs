//! Event records and the sink interface they are written to.
//!
//! Sessions emit [`LogRecord`]s through a [`SinkGuard`]. The guard disables its
//! sink after the first failed write so measurement never stalls on a broken
//! log, and keeps that first error for the final report.

use chrono::{DateTime, Local};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::analyzer::FlipEvent;
use crate::discovery::AggressorVictimTriplet;
use crate::memory::PhysAddr;

/// Errors that can occur when writing records.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Underlying writer failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The sink was disabled by an earlier failure
    #[error("sink disabled after earlier failure")]
    Disabled,
}

/// One row for the logging collaborator.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "UPPERCASE")]
pub enum LogRecord {
    /// A byte that differs from the fill pattern
    Flip(FlipEvent),
    /// Whole-region entropy sample
    Entropy {
        /// When the sample was taken
        timestamp: DateTime<Local>,
        /// Entropy in bits
        entropy: f64,
    },
    /// State of one chunk at one adaptive sampling point
    Region {
        /// Sampling point
        round: u64,
        /// Chunk index
        chunk: usize,
        /// Chunk entropy
        entropy: f64,
        /// Mismatching bytes in the chunk
        flip_count: usize,
    },
    /// Result of scanning one triplet
    Triplet {
        /// Scan round
        round: u64,
        /// Page indices and victim flips
        triplet: AggressorVictimTriplet,
        /// Physical addresses of aggressor, victim, aggressor
        phys: [PhysAddr; 3],
    },
}

impl LogRecord {
    /// Entropy sample taken now.
    pub fn entropy(entropy: f64) -> Self {
        LogRecord::Entropy {
            timestamp: Local::now(),
            entropy,
        }
    }

    /// Upper-case event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            LogRecord::Flip(_) => "FLIP",
            LogRecord::Entropy { .. } => "ENTROPY",
            LogRecord::Region { .. } => "REGION",
            LogRecord::Triplet { .. } => "TRIPLET",
        }
    }
}

/// Destination for [`LogRecord`]s.
pub trait EventSink {
    /// Writes one record.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the record could not be written.
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError>;

    /// Flushes buffered records.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if buffered records could not be written.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<LogRecord>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Records of one event type.
    pub fn of_type<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a LogRecord> {
        self.records
            .iter()
            .filter(move |r| r.event_type() == event_type)
    }
}

impl EventSink for MemorySink {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        self.records.push(record.clone());
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        (**self).record(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        (**self).record(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Wraps a sink and disables it after the first failure.
pub struct SinkGuard<S> {
    sink: S,
    failure: Option<String>,
    dropped: u64,
}

impl<S: EventSink> SinkGuard<S> {
    /// Wraps `sink`.
    pub fn new(sink: S) -> Self {
        SinkGuard {
            sink,
            failure: None,
            dropped: 0,
        }
    }

    /// Writes `record` unless the sink is disabled.
    ///
    /// The first failure is logged, remembered and returned; every later call
    /// returns [`SinkError::Disabled`] without touching the sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the record was not written.
    pub fn record(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        if self.failure.is_some() {
            self.dropped += 1;
            return Err(SinkError::Disabled);
        }
        self.sink.record(record).inspect_err(|e| self.disable(e))
    }

    /// Flushes the sink unless it is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the flush failed or the sink is disabled.
    pub fn flush(&mut self) -> Result<(), SinkError> {
        if self.failure.is_some() {
            return Err(SinkError::Disabled);
        }
        self.sink.flush().inspect_err(|e| self.disable(e))
    }

    fn disable(&mut self, e: &SinkError) {
        warn!("Event sink failed, disabling it: {}", e);
        self.failure = Some(e.to_string());
    }

    /// Message of the failure that disabled the sink.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Records skipped after the sink was disabled.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// The wrapped sink.
    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    /// Unwraps the guard.
    pub fn into_inner(self) -> S {
        if self.dropped > 0 {
            debug!("{} records dropped by disabled sink", self.dropped);
        }
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fails every write after `ok` successful ones.
    struct FailingSink {
        ok: usize,
        written: usize,
    }

    impl EventSink for FailingSink {
        fn record(&mut self, _record: &LogRecord) -> Result<(), SinkError> {
            if self.written == self.ok {
                return Err(std::io::Error::other("disk full").into());
            }
            self.written += 1;
            Ok(())
        }
    }

    #[test]
    fn test_guard_disables_after_first_failure() {
        let mut guard = SinkGuard::new(FailingSink { ok: 1, written: 0 });
        let rec = LogRecord::entropy(0.0);
        assert!(guard.record(&rec).is_ok());
        assert!(matches!(guard.record(&rec), Err(SinkError::Io(_))));
        assert!(matches!(guard.record(&rec), Err(SinkError::Disabled)));
        assert!(matches!(guard.flush(), Err(SinkError::Disabled)));
        assert_eq!(guard.failure(), Some("disk full"));
        assert_eq!(guard.dropped(), 1);
        assert_eq!(guard.into_inner().written, 1);
    }

    #[test]
    fn test_memory_sink_filters_by_type() {
        let mut sink = MemorySink::new();
        sink.record(&LogRecord::entropy(1.5)).unwrap();
        sink.record(&LogRecord::Flip(FlipEvent::new(3, 0xAA, 0xAB)))
            .unwrap();
        sink.record(&LogRecord::Region {
            round: 0,
            chunk: 1,
            entropy: 0.0,
            flip_count: 0,
        })
        .unwrap();
        assert_eq!(sink.records().len(), 3);
        assert_eq!(sink.of_type("FLIP").count(), 1);
        assert_eq!(sink.records()[2].event_type(), "REGION");
    }

    #[test]
    fn test_record_serializes_with_tag() {
        let json = serde_json::to_value(LogRecord::Region {
            round: 2,
            chunk: 5,
            entropy: 0.5,
            flip_count: 1,
        })
        .unwrap();
        assert_eq!(json["event"], "REGION");
        assert_eq!(json["chunk"], 5);
    }
}
