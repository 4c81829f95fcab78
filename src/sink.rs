//! Record sinks. A sink durably records serialized events, one per line.

// System
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

// Third Party
use tracing::debug;

// Local
use crate::error::SinkError;
use crate::record::WireRecord;

/// How a record is rendered on its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// `{"type":"ADDED","object":{...}}`
    Json,
    /// `type=ADDED object={...}`
    Text,
}

impl RecordFormat {
    pub fn from_setting(value: &str) -> Option<Self> {
        match value {
            "json" => Some(RecordFormat::Json),
            "text" => Some(RecordFormat::Text),
            _ => None,
        }
    }
}

/// Where records are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    Stderr,
    /// Opened in append mode, created if missing.
    File(PathBuf),
}

/// The capability the pump writes records through.
pub trait Sink: Send {
    fn emit(&mut self, record: &WireRecord) -> Result<(), SinkError>;

    /// Flush buffered output and release the underlying resource. A no-op for
    /// sinks with nothing to close. Emits after this fail with `SinkError::Closed`.
    fn flush_and_close(&mut self) -> Result<(), SinkError>;
}

enum Output {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(File),
    Writer(Box<dyn Write + Send>),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Stdout(out) => out.write(buf),
            Output::Stderr(out) => out.write(buf),
            Output::File(file) => file.write(buf),
            Output::Writer(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Stdout(out) => out.flush(),
            Output::Stderr(out) => out.flush(),
            Output::File(file) => file.flush(),
            Output::Writer(writer) => writer.flush(),
        }
    }
}

/// Line-oriented sink over stdout, stderr, a file, or any writer.
///
/// Each record is assembled in a buffer and handed to the destination in a
/// single write. A file destination is `fsync`ed on close.
pub struct LineSink {
    format: RecordFormat,
    writer: Option<BufWriter<Output>>,
}

impl LineSink {
    pub fn open(destination: &Destination, format: RecordFormat) -> Result<Self, SinkError> {
        let output = match destination {
            Destination::Stdout => Output::Stdout(io::stdout()),
            Destination::Stderr => Output::Stderr(io::stderr()),
            Destination::File(path) => {
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .map_err(|source| SinkError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Output::File(file)
            }
        };
        Ok(Self::from_output(output, format))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>, format: RecordFormat) -> Self {
        Self::from_output(Output::Writer(writer), format)
    }

    fn from_output(output: Output, format: RecordFormat) -> Self {
        Self {
            format,
            writer: Some(BufWriter::new(output)),
        }
    }
}

impl Sink for LineSink {
    fn emit(&mut self, record: &WireRecord) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        match self.format {
            RecordFormat::Json => {
                serde_json::to_writer(&mut *writer, record).map_err(io::Error::from)?;
                writer.write_all(b"\n")?;
            }
            RecordFormat::Text => {
                writeln!(writer, "type={} object={}", record.event_type, record.object)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        let output = writer.into_inner().map_err(|e| e.into_error())?;
        if let Output::File(file) = output {
            file.sync_all()?;
            debug!("Log file synced and closed");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    // System
    use std::sync::{Arc, Mutex};

    // Local
    use super::*;

    #[derive(Default)]
    pub struct Recorded {
        pub records: Vec<WireRecord>,
        /// Records written but not yet flushed.
        pub buffered: Vec<WireRecord>,
        pub failures_left: u32,
        pub attempts: usize,
        pub closed: bool,
    }

    /// An in-memory sink that buffers until closed and can be told to fail.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub state: Arc<Mutex<Recorded>>,
    }

    impl RecordingSink {
        pub fn failing(failures: u32) -> Self {
            let sink = Self::default();
            sink.state.lock().unwrap().failures_left = failures;
            sink
        }

        /// Records durably written so far, in order.
        pub fn records(&self) -> Vec<WireRecord> {
            self.state.lock().unwrap().records.clone()
        }

        /// Everything accepted by `emit`, flushed or not, in order.
        pub fn written(&self) -> Vec<WireRecord> {
            let state = self.state.lock().unwrap();
            state.records.iter().chain(&state.buffered).cloned().collect()
        }

        pub fn buffered(&self) -> usize {
            self.state.lock().unwrap().buffered.len()
        }

        pub fn attempts(&self) -> usize {
            self.state.lock().unwrap().attempts
        }

        pub fn closed(&self) -> bool {
            self.state.lock().unwrap().closed
        }
    }

    impl Sink for RecordingSink {
        fn emit(&mut self, record: &WireRecord) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            if state.closed {
                return Err(SinkError::Closed);
            }
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(SinkError::Write(io::Error::new(
                    io::ErrorKind::Other,
                    "disk full",
                )));
            }
            state.buffered.push(record.clone());
            Ok(())
        }

        fn flush_and_close(&mut self) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            let buffered = std::mem::take(&mut state.buffered);
            state.records.extend(buffered);
            state.closed = true;
            Ok(())
        }
    }
}
