use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use serde::Serialize;

/// Sink for scalar training metrics.
pub trait Telemetry: Send {
    fn report(&mut self, name: &str, value: f64);
}

/// Reports through the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn report(&mut self, name: &str, value: f64) {
        debug!("[metric] {name} = {value:.5}");
    }
}

/// Drops everything. Used by workers other than rank 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn report(&mut self, _name: &str, _value: f64) {}
}

#[derive(Serialize)]
struct MetricRecord<'a> {
    name: &'a str,
    value: f64,
    timestamp_ms: u128,
}

/// Appends one JSON object per metric to a file.
pub struct JsonLinesTelemetry {
    writer: BufWriter<File>,
    failed: bool,
}

impl JsonLinesTelemetry {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            failed: false,
        })
    }

    fn write(&mut self, name: &str, value: f64) -> std::io::Result<()> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        serde_json::to_writer(
            &mut self.writer,
            &MetricRecord {
                name,
                value,
                timestamp_ms,
            },
        )?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl Telemetry for JsonLinesTelemetry {
    fn report(&mut self, name: &str, value: f64) {
        if let Err(e) = self.write(name, value) {
            if !self.failed {
                warn!("Could not write metric {name}: {e}");
                self.failed = true;
            }
        }
    }
}

/// Forwards each metric to every inner sink.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn Telemetry>>,
}

impl Fanout {
    pub fn with(mut self, sink: impl Telemetry + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Telemetry for Fanout {
    fn report(&mut self, name: &str, value: f64) {
        for sink in &mut self.sinks {
            sink.report(name, value);
        }
    }
}

impl<T: Telemetry + ?Sized> Telemetry for Box<T> {
    fn report(&mut self, name: &str, value: f64) {
        (**self).report(name, value);
    }
}
