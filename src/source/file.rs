//! File-replay data source
//!
//! Replays a previous recording as if it were a live array, one
//! read-interval worth of rows per poll. The backing file library is not
//! reentrant across threads, so `is_thread_safe` is false and the
//! coordinator drives this source inline.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use super::{DataSource, StatusMap, StatusValue};
use crate::frame::Samples;
use crate::recording::RecordingReader;

pub struct FileSource {
    location: String,
    reader: Option<RecordingReader>,
    /// Next row to replay.
    position: u64,
    /// Rows emitted per poll once streaming.
    chunk: u64,
    streaming: bool,
}

impl FileSource {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            reader: None,
            position: 0,
            chunk: 0,
            streaming: false,
        }
    }

    fn reader(&self) -> Result<&RecordingReader> {
        self.reader
            .as_ref()
            .context("the file source has not been initialized")
    }
}

impl DataSource for FileSource {
    fn source_type(&self) -> &'static str {
        "file"
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn is_thread_safe(&self) -> bool {
        false
    }

    fn initialize(&mut self) -> Result<()> {
        if self.reader.is_some() {
            bail!("the file source is already initialized");
        }
        let reader = RecordingReader::open(Path::new(&self.location))?;
        if reader.nsamples() == 0 {
            bail!("recording file {} holds no samples", self.location);
        }
        self.reader = Some(reader);
        Ok(())
    }

    fn status(&self) -> StatusMap {
        let mut map = StatusMap::new();
        map.insert(
            "source-type".into(),
            StatusValue::Str("file".into()),
        );
        map.insert(
            "device-type".into(),
            StatusValue::Str("file".into()),
        );
        map.insert(
            "location".into(),
            StatusValue::Str(self.location.clone()),
        );
        if let Some(reader) = &self.reader {
            map.insert("nchannels".into(), StatusValue::Int(reader.nchannels() as i64));
            map.insert("sample-rate".into(), StatusValue::Float(reader.sample_rate()));
            map.insert("gain".into(), StatusValue::Float(reader.gain() as f64));
            map.insert("adc-range".into(), StatusValue::Float(reader.offset() as f64));
            map.insert("length".into(), StatusValue::Float(reader.length()));
            map.insert(
                "has-analog-output".into(),
                StatusValue::Bool(reader.analog_output_size() > 0),
            );
            if !reader.date().is_empty() {
                map.insert("date".into(), StatusValue::Str(reader.date().to_string()));
            }
            if !reader.configuration().is_empty() {
                map.insert(
                    "configuration".into(),
                    StatusValue::Bytes(reader.configuration().to_vec()),
                );
            }
        }
        map
    }

    fn get(&self, param: &str) -> Result<StatusValue> {
        self.status()
            .remove(param)
            .with_context(|| format!("Unknown parameter: {param}"))
    }

    fn set(&mut self, param: &str, _value: StatusValue) -> Result<()> {
        bail!("Cannot set parameter '{param}': a file source replays its recording as-is.")
    }

    fn start_stream(&mut self, interval: Duration) -> Result<()> {
        let reader = self.reader()?;
        if self.streaming {
            bail!("the stream is already running");
        }
        let rows = (reader.sample_rate() * interval.as_secs_f64()).round() as u64;
        self.chunk = rows.max(1);
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        if !self.streaming {
            bail!("the stream is not running");
        }
        self.streaming = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Option<Samples>> {
        let position = self.position;
        let chunk = self.chunk;
        let Some(reader) = self.reader.as_mut() else {
            bail!("the file source has not been initialized");
        };
        if position >= reader.nsamples() {
            return Ok(None);
        }
        let end = (position + chunk).min(reader.nsamples());
        let samples = reader.read(position, end)?;
        self.position = end;
        Ok(Some(samples))
    }
}
