//! Sample matrices and the data frame sent to remote clients
//!
//! A [`Samples`] value is a row-major matrix of 16-bit signed samples with
//! shape `(nsamples, nchannels)`; rows are points in time, columns are
//! electrode channels. A [`DataFrame`] pairs one such batch with the start
//! and stop times (in seconds) it covers within the recording.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Row-major matrix of 16-bit signed samples, shape `(nsamples, nchannels)`.
///
/// The channel count is fixed at construction; every appended or decoded
/// batch from one source shares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Samples {
    data: Vec<i16>,
    nchannels: u32,
}

impl Samples {
    /// Wrap a row-major buffer. The buffer length must be a whole number of
    /// rows of `nchannels` samples.
    pub fn from_vec(data: Vec<i16>, nchannels: u32) -> Self {
        assert!(nchannels > 0, "sample matrix must have at least one channel");
        assert!(
            data.len() % nchannels as usize == 0,
            "sample buffer is not a whole number of rows"
        );
        Self { data, nchannels }
    }

    /// An all-zero batch of `nsamples` rows.
    pub fn zeros(nsamples: u32, nchannels: u32) -> Self {
        assert!(nchannels > 0, "sample matrix must have at least one channel");
        Self {
            data: vec![0; nsamples as usize * nchannels as usize],
            nchannels,
        }
    }

    /// Number of rows (points in time) in this batch.
    pub fn nsamples(&self) -> u32 {
        (self.data.len() / self.nchannels as usize) as u32
    }

    /// Number of channels per row.
    pub fn nchannels(&self) -> u32 {
        self.nchannels
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The underlying row-major sample buffer.
    pub fn as_slice(&self) -> &[i16] {
        &self.data
    }

    /// One row of channel values.
    pub fn row(&self, index: u32) -> &[i16] {
        let nch = self.nchannels as usize;
        let off = index as usize * nch;
        &self.data[off..off + nch]
    }
}

/// A chunk of data sent to remote clients: the samples plus the time in the
/// recording, in seconds, of its start and stop.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    start: f32,
    stop: f32,
    samples: Samples,
}

impl DataFrame {
    pub fn new(start: f32, stop: f32, samples: Samples) -> Self {
        Self {
            start,
            stop,
            samples,
        }
    }

    pub fn start(&self) -> f32 {
        self.start
    }

    pub fn stop(&self) -> f32 {
        self.stop
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    pub fn nsamples(&self) -> u32 {
        self.samples.nsamples()
    }

    pub fn nchannels(&self) -> u32 {
        self.samples.nchannels()
    }

    /// Encoded size of the frame body in bytes.
    pub fn byte_size(&self) -> usize {
        4 + 4 + 4 + 4 + self.samples.as_slice().len() * 2
    }

    /// Serialize the frame body: f32 start, f32 stop, u32 nsamples,
    /// u32 nchannels, then the row-major samples, all little-endian.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.byte_size());
        buf.put_f32_le(self.start);
        buf.put_f32_le(self.stop);
        buf.put_u32_le(self.nsamples());
        buf.put_u32_le(self.nchannels());
        for &sample in self.samples.as_slice() {
            buf.put_i16_le(sample);
        }
    }

    /// Decode a frame body produced by [`encode_into`](Self::encode_into).
    pub fn decode(mut buf: Bytes) -> anyhow::Result<Self> {
        if buf.len() < 16 {
            anyhow::bail!("data frame body too small: {} < 16", buf.len());
        }
        let start = buf.get_f32_le();
        let stop = buf.get_f32_le();
        let nsamples = buf.get_u32_le();
        let nchannels = buf.get_u32_le();
        let expected = nsamples as usize * nchannels as usize * 2;
        if buf.len() != expected {
            anyhow::bail!(
                "data frame body has {} sample bytes, expected {}",
                buf.len(),
                expected
            );
        }
        if nchannels == 0 {
            anyhow::bail!("data frame has zero channels");
        }
        let mut data = Vec::with_capacity(nsamples as usize * nchannels as usize);
        while buf.has_remaining() {
            data.push(buf.get_i16_le());
        }
        Ok(Self {
            start,
            stop,
            samples: Samples::from_vec(data, nchannels),
        })
    }
}
