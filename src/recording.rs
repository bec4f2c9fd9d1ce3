//! On-disk recording sink
//!
//! A recording is one flat file: a fixed self-describing header (sample
//! rate, channel count, gain, offset, date, analog-output size and an
//! opaque device configuration blob), followed by row-major little-endian
//! i16 samples. The header's sample count is kept current on every append
//! so a reader always sees a consistent file.
//!
//! The acquisition pipeline treats the sink through the [`RecordingSink`]
//! trait: append-only writes at the tail, random range reads behind the
//! tail, and attribute setters that are only legal before the first append.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};

use crate::config::SAVE_FILENAME_FORMAT;
use crate::frame::Samples;

const MAGIC: &[u8; 4] = b"RDN1";
const VERSION: u32 = 1;

/// Fixed header length in bytes.
const HEADER_LEN: usize = 128;

/// Capacity reserved for the opaque configuration blob.
const CONFIG_CAPACITY: usize = 512;

/// Offset of the first sample row.
const DATA_OFFSET: u64 = (HEADER_LEN + CONFIG_CAPACITY) as u64;

/// Longest date string the header can hold.
const DATE_CAPACITY: usize = 40;

/// Byte offset of the sample-count field within the header.
const NSAMPLES_OFFSET: u64 = 32;

/// The append/read contract the coordinator requires of a recording.
pub trait RecordingSink: Send {
    fn path(&self) -> &Path;

    /// Sampling rate of the recorded data, in Hz.
    fn sample_rate(&self) -> f64;

    fn nchannels(&self) -> u32;

    /// Rows recorded so far.
    fn nsamples(&self) -> u64;

    /// Length of the recording in seconds.
    fn length(&self) -> f64 {
        self.nsamples() as f64 / self.sample_rate()
    }

    fn set_gain(&mut self, gain: f32) -> Result<()>;
    fn set_offset(&mut self, offset: f32) -> Result<()>;

    /// Record the acquisition date, an ISO-8601 string.
    fn set_date(&mut self, date: &str) -> Result<()>;

    /// Number of analog-output channels (sources without a HiDens-style
    /// configuration).
    fn set_analog_output_size(&mut self, size: u32) -> Result<()>;

    /// Opaque device configuration blob (HiDens-style sources).
    fn set_configuration(&mut self, config: &[u8]) -> Result<()>;

    /// Append a batch of rows at the tail of the recording.
    fn append(&mut self, samples: &Samples) -> Result<()>;

    /// Read rows `[start, end)`. Both bounds must lie within the data
    /// recorded so far.
    fn read(&mut self, start: u64, end: u64) -> Result<Samples>;

    /// Flush everything to disk; the file remains valid afterwards.
    fn finalize(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Header {
    nchannels: u32,
    analog_output_size: u32,
    sample_rate: f64,
    gain: f32,
    offset: f32,
    nsamples: u64,
    date: String,
    config: Vec<u8>,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nchannels.to_le_bytes());
        buf[12..16].copy_from_slice(&self.analog_output_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[24..28].copy_from_slice(&self.gain.to_le_bytes());
        buf[28..32].copy_from_slice(&self.offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.nsamples.to_le_bytes());
        let date = self.date.as_bytes();
        buf[40..40 + date.len()].copy_from_slice(date);
        buf[80..84].copy_from_slice(&(self.config.len() as u32).to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if &buf[0..4] != MAGIC {
            bail!("not a raiden recording file");
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            bail!("unsupported recording file version {version}");
        }
        let date_field = &buf[40..40 + DATE_CAPACITY];
        let date_len = date_field.iter().position(|&b| b == 0).unwrap_or(DATE_CAPACITY);
        let date = std::str::from_utf8(&date_field[..date_len])
            .context("recording date is not valid UTF-8")?
            .to_string();
        Ok(Self {
            nchannels: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            analog_output_size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            sample_rate: f64::from_le_bytes(buf[16..24].try_into().unwrap()),
            gain: f32::from_le_bytes(buf[24..28].try_into().unwrap()),
            offset: f32::from_le_bytes(buf[28..32].try_into().unwrap()),
            nsamples: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            date,
            config: Vec::new(),
        })
    }
}

/// The on-disk recording being written during a streaming session.
pub struct RecordingFile {
    file: File,
    path: PathBuf,
    header: Header,
}

impl RecordingFile {
    /// Create a new recording. Fails if `path` already exists.
    pub fn create(path: &Path, sample_rate: f64, nchannels: u32) -> Result<Self> {
        if sample_rate <= 0.0 {
            bail!("sample rate must be positive, got {sample_rate}");
        }
        if nchannels == 0 {
            bail!("recording must have at least one channel");
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("could not create recording file {}", path.display()))?;

        let header = Header {
            nchannels,
            analog_output_size: 0,
            sample_rate,
            gain: 1.0,
            offset: 0.0,
            nsamples: 0,
            date: String::new(),
            config: Vec::new(),
        };
        let mut recording = Self {
            file,
            path: path.to_path_buf(),
            header,
        };
        recording.write_header()?;
        Ok(recording)
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        let mut config_region = vec![0u8; CONFIG_CAPACITY];
        config_region[..self.header.config.len()].copy_from_slice(&self.header.config);
        self.file.write_all(&config_region)?;
        Ok(())
    }

    fn row_bytes(&self) -> u64 {
        self.header.nchannels as u64 * 2
    }

    /// Attribute setters are only legal before the first sample lands.
    fn ensure_unwritten(&self, what: &str) -> Result<()> {
        if self.header.nsamples > 0 {
            bail!("cannot set the {what} after samples have been appended");
        }
        Ok(())
    }
}

impl RecordingSink for RecordingFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn sample_rate(&self) -> f64 {
        self.header.sample_rate
    }

    fn nchannels(&self) -> u32 {
        self.header.nchannels
    }

    fn nsamples(&self) -> u64 {
        self.header.nsamples
    }

    fn set_gain(&mut self, gain: f32) -> Result<()> {
        self.ensure_unwritten("gain")?;
        self.header.gain = gain;
        self.write_header()
    }

    fn set_offset(&mut self, offset: f32) -> Result<()> {
        self.ensure_unwritten("offset")?;
        self.header.offset = offset;
        self.write_header()
    }

    fn set_date(&mut self, date: &str) -> Result<()> {
        self.ensure_unwritten("date")?;
        if date.len() > DATE_CAPACITY {
            bail!("date string of {} bytes exceeds the {DATE_CAPACITY}-byte field", date.len());
        }
        self.header.date = date.to_string();
        self.write_header()
    }

    fn set_analog_output_size(&mut self, size: u32) -> Result<()> {
        self.ensure_unwritten("analog-output size")?;
        self.header.analog_output_size = size;
        self.write_header()
    }

    fn set_configuration(&mut self, config: &[u8]) -> Result<()> {
        self.ensure_unwritten("configuration")?;
        if config.len() > CONFIG_CAPACITY {
            bail!(
                "configuration of {} bytes exceeds the {CONFIG_CAPACITY}-byte region",
                config.len()
            );
        }
        self.header.config = config.to_vec();
        self.write_header()
    }

    fn append(&mut self, samples: &Samples) -> Result<()> {
        if samples.nchannels() != self.header.nchannels {
            bail!(
                "sample batch has {} channels, recording has {}",
                samples.nchannels(),
                self.header.nchannels
            );
        }
        if samples.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(samples.as_slice().len() * 2);
        for &sample in samples.as_slice() {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let offset = DATA_OFFSET + self.header.nsamples * self.row_bytes();
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(&bytes)
            .with_context(|| format!("could not append to {}", self.path.display()))?;

        self.header.nsamples += samples.nsamples() as u64;
        self.file.seek(SeekFrom::Start(NSAMPLES_OFFSET))?;
        self.file.write_all(&self.header.nsamples.to_le_bytes())?;
        Ok(())
    }

    fn read(&mut self, start: u64, end: u64) -> Result<Samples> {
        read_rows(
            &mut self.file,
            self.header.nchannels,
            self.header.nsamples,
            start,
            end,
        )
        .with_context(|| format!("could not read from {}", self.path.display()))
    }

    fn finalize(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(NSAMPLES_OFFSET))?;
        self.file.write_all(&self.header.nsamples.to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Read-only access to a finished recording, used by file-replay sources.
pub struct RecordingReader {
    file: File,
    path: PathBuf,
    header: Header,
}

impl RecordingReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("could not open recording file {}", path.display()))?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .with_context(|| format!("could not read header of {}", path.display()))?;
        let mut header = Header::decode(&buf)?;

        let mut config_region = vec![0u8; CONFIG_CAPACITY];
        file.read_exact(&mut config_region)?;
        let config_len = u32::from_le_bytes(buf[80..84].try_into().unwrap()) as usize;
        if config_len > CONFIG_CAPACITY {
            bail!("corrupt configuration length {config_len}");
        }
        config_region.truncate(config_len);
        header.config = config_region;

        if header.nchannels == 0 || header.sample_rate <= 0.0 {
            bail!("recording file {} has a corrupt header", path.display());
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> f64 {
        self.header.sample_rate
    }

    pub fn nchannels(&self) -> u32 {
        self.header.nchannels
    }

    pub fn nsamples(&self) -> u64 {
        self.header.nsamples
    }

    pub fn length(&self) -> f64 {
        self.header.nsamples as f64 / self.header.sample_rate
    }

    pub fn gain(&self) -> f32 {
        self.header.gain
    }

    pub fn offset(&self) -> f32 {
        self.header.offset
    }

    pub fn date(&self) -> &str {
        &self.header.date
    }

    pub fn analog_output_size(&self) -> u32 {
        self.header.analog_output_size
    }

    pub fn configuration(&self) -> &[u8] {
        &self.header.config
    }

    /// Read rows `[start, end)`.
    pub fn read(&mut self, start: u64, end: u64) -> Result<Samples> {
        read_rows(
            &mut self.file,
            self.header.nchannels,
            self.header.nsamples,
            start,
            end,
        )
        .with_context(|| format!("could not read from {}", self.path.display()))
    }
}

fn read_rows(file: &mut File, nchannels: u32, nsamples: u64, start: u64, end: u64) -> Result<Samples> {
    if start >= end {
        bail!("empty sample range [{start}, {end})");
    }
    if end > nsamples {
        bail!("sample range [{start}, {end}) past the {nsamples} recorded samples");
    }
    let row_bytes = nchannels as u64 * 2;
    let mut bytes = vec![0u8; ((end - start) * row_bytes) as usize];
    file.seek(SeekFrom::Start(DATA_OFFSET + start * row_bytes))?;
    file.read_exact(&mut bytes)?;

    let data = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(Samples::from_vec(data, nchannels))
}

/// The filename a recording lands under: the client-chosen name, or a
/// timestamp when none was set, with `.h5` appended unless the name already
/// carries a recognized extension.
pub fn resolve_save_filename(requested: &str, now: DateTime<Local>) -> String {
    let mut name = if requested.is_empty() {
        now.format(SAVE_FILENAME_FORMAT).to_string()
    } else {
        requested.to_string()
    };
    if !name.ends_with(".h5") && !name.ends_with(".hdf5") {
        name.push_str(".h5");
    }
    name
}
