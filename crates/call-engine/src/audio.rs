//! Audio device abstraction
//!
//! The engine never touches audio hardware. It talks to an [`AudioDevice`]
//! collaborator that hands out a capture stream and a playback sink of raw
//! PCM chunks for the duration of one call.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// Buffered chunks between the device and the media loops
pub const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// PCM format exchanged with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Frame size in milliseconds
    pub frame_size_ms: u32,
}

impl Default for AudioFormat {
    /// 16 kHz mono 16-bit, 20 ms frames
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
            frame_size_ms: 20,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16, frame_size_ms: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            frame_size_ms,
        }
    }

    /// Samples per channel in one frame
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }

    /// Size of one frame in bytes
    pub fn bytes_per_frame(&self) -> usize {
        self.samples_per_frame() * self.bytes_per_sample_frame()
    }

    /// Bytes per sample across all channels
    pub fn bytes_per_sample_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Media timestamp advance for a chunk of `len` bytes
    pub fn timestamp_increment(&self, len: usize) -> u32 {
        match self.bytes_per_sample_frame() {
            0 => 0,
            n => (len / n) as u32,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_size_ms as u64)
    }
}

/// Duplex audio device used for the lifetime of one call.
///
/// `open_capture` and `open_playback` are called when a call connects;
/// `close` is called when it ends and must release both directions. Calling
/// `close` on an idle device is a no-op.
#[async_trait]
pub trait AudioDevice: Send + Sync + fmt::Debug {
    /// Start capturing; captured chunks arrive on the returned receiver
    async fn open_capture(&self, format: &AudioFormat) -> Result<mpsc::Receiver<Bytes>>;

    /// Start playback; chunks sent on the returned sender are played
    async fn open_playback(&self, format: &AudioFormat) -> Result<mpsc::Sender<Bytes>>;

    /// Release capture and playback
    async fn close(&self);

    /// Route playback to the loudspeaker (`true`) or the earpiece (`false`)
    fn set_speaker_routing(&self, speaker: bool);
}

/// Device that captures silence and discards playback.
///
/// Useful on hosts without audio hardware; the media path still runs at the
/// real frame rate.
#[derive(Debug, Default)]
pub struct SilentAudioDevice {
    active: Mutex<Option<CancellationToken>>,
    speaker: AtomicBool,
}

impl SilentAudioDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current speaker routing
    pub fn speaker_routing(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }

    fn session_token(&self) -> CancellationToken {
        self.active.lock().get_or_insert_with(CancellationToken::new).clone()
    }
}

#[async_trait]
impl AudioDevice for SilentAudioDevice {
    async fn open_capture(&self, format: &AudioFormat) -> Result<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let token = self.session_token();
        let frame = Bytes::from(vec![0u8; format.bytes_per_frame()]);
        let mut ticker = tokio::time::interval(format.frame_duration());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(frame.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Silent capture stopped");
        });

        Ok(rx)
    }

    async fn open_playback(&self, _format: &AudioFormat) -> Result<mpsc::Sender<Bytes>> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(AUDIO_CHANNEL_CAPACITY);
        let token = self.session_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = rx.recv() => {
                        if chunk.is_none() {
                            break;
                        }
                    }
                }
            }
            debug!("Silent playback stopped");
        });

        Ok(tx)
    }

    async fn close(&self) {
        if let Some(token) = self.active.lock().take() {
            token.cancel();
        }
    }

    fn set_speaker_routing(&self, speaker: bool) {
        self.speaker.store(speaker, Ordering::SeqCst);
    }
}
