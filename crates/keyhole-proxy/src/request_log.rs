use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const RECORD_SCHEMA: &str = "keyhole-request-log-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct RequestRecord<'a> {
    schema: &'static str,
    unix_ms: u128,
    pub(crate) host: &'a str,
    pub(crate) port: u16,
    pub(crate) method: &'a str,
    pub(crate) target: &'a str,
    pub(crate) status_code: u16,
}

impl<'a> RequestRecord<'a> {
    pub(crate) fn new(
        host: &'a str,
        port: u16,
        method: &'a str,
        target: &'a str,
        status_code: u16,
    ) -> Self {
        Self {
            schema: RECORD_SCHEMA,
            unix_ms: now_unix_ms(),
            host,
            port,
            method,
            target,
            status_code,
        }
    }
}

/// Line-oriented JSON log of proxied requests. Best-effort: a write failure
/// is reported through `tracing` and never fails the connection that caused
/// it.
pub struct RequestLog {
    writer: Mutex<BufWriter<File>>,
}

impl RequestLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub(crate) fn record(&self, record: &RequestRecord<'_>) {
        if let Err(error) = self.write_record(record) {
            tracing::warn!(%error, "request log write failed");
        }
    }

    fn write_record(&self, record: &RequestRecord<'_>) -> io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("request log lock poisoned"))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}
