pub mod capture;
pub mod playback;

pub use capture::Capture;
pub use playback::Playback;

/// Opus RTP always runs a 48 kHz clock; capture and playback are set up for
/// it and other device rates are rejected rather than resampled.
pub const SAMPLE_RATE: u32 = 48_000;
/// Samples in one 20 ms mono frame at [`SAMPLE_RATE`].
pub(crate) const FRAME_SAMPLES: usize = SAMPLE_RATE as usize / 50;

/// Where outgoing audio frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioInput {
    /// Capture from the default input device.
    #[default]
    Device,
    /// Generate encoded silence. Lets mic-less hosts (and tests) run a full
    /// session.
    Silence,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub input: AudioInput,
    /// Opus target bitrate in bits per second.
    pub bitrate: u32,
    /// Whether remote tracks should be played on the default output device.
    pub playback: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            input: AudioInput::Device,
            bitrate: 32_000,
            playback: true,
        }
    }
}

/// Sample rates the opus codec accepts.
pub(crate) fn opus_compatible(rate: u32) -> bool {
    matches!(rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000)
}
