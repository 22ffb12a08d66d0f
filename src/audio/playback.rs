use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use anyhow::{Result, anyhow};
use cpal::SupportedStreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use opus::{Channels, Decoder};
use tracing::{debug, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{SAMPLE_RATE, opus_compatible};
use crate::errors::Error;

// largest opus frame: 120 ms at 48 kHz
const MAX_FRAME_SAMPLES: usize = 5760;

/// Plays one remote track on the default output device. Every remote
/// participant gets its own stream; the OS mixer combines them.
pub struct Playback {
    running: Arc<AtomicBool>,
}

impl Playback {
    pub fn start(track: Arc<TrackRemote>) -> Result<Playback> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(Error::NoOutputDevice)?;
        let supported = select_output_config(&device)?;
        let running = Arc::new(AtomicBool::new(true));
        let (payload_tx, payload_rx) = mpsc::channel::<Vec<u8>>();

        // async side: depacketize RTP into raw opus payloads
        let reader_running = running.clone();
        tokio::spawn(async move {
            while reader_running.load(Ordering::Relaxed) {
                match track.read_rtp().await {
                    Ok((packet, _)) => {
                        if packet.payload.is_empty() {
                            continue;
                        }
                        if payload_tx.send(packet.payload.to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!("remote track ended: {err}");
                        break;
                    }
                }
            }
        });

        // sync side: decode and feed the output stream on its own thread
        let thread_running = running.clone();
        std::thread::spawn(move || {
            if let Err(err) = run_output(device, supported, payload_rx, thread_running) {
                warn!("audio playback stopped: {err}");
            }
        });

        Ok(Playback { running })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn select_output_config(device: &cpal::Device) -> Result<SupportedStreamConfig> {
    if let Ok(configs) = device.supported_output_configs() {
        for range in configs {
            if range.min_sample_rate().0 <= SAMPLE_RATE && SAMPLE_RATE <= range.max_sample_rate().0
            {
                return Ok(range.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)));
            }
        }
    }
    let fallback = device.default_output_config()?;
    if !opus_compatible(fallback.sample_rate().0) {
        return Err(anyhow!(
            "output device rate {} Hz is not usable for opus",
            fallback.sample_rate().0
        ));
    }
    Ok(fallback)
}

fn run_output(
    device: cpal::Device,
    supported: SupportedStreamConfig,
    payloads: mpsc::Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let rate = supported.sample_rate().0;
    let out_channels = supported.channels() as usize;
    let mut decoder = Decoder::new(rate, Channels::Mono)?;

    let buffer = Arc::new(Mutex::new(VecDeque::<i16>::new()));
    let err_fn = |err| warn!("output stream error: {err}");
    let stream_config = supported.config();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            let buffer = buffer.clone();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _| {
                    let mut buf = buffer.lock().unwrap();
                    for frame in data.chunks_mut(out_channels) {
                        let sample = buf.pop_front().unwrap_or(0);
                        let value = sample as f32 / 32768.0;
                        for slot in frame {
                            *slot = value;
                        }
                    }
                },
                err_fn,
                None,
            )?
        }
        cpal::SampleFormat::I16 => {
            let buffer = buffer.clone();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _| {
                    let mut buf = buffer.lock().unwrap();
                    for frame in data.chunks_mut(out_channels) {
                        let sample = buf.pop_front().unwrap_or(0);
                        for slot in frame {
                            *slot = sample;
                        }
                    }
                },
                err_fn,
                None,
            )?
        }
        other => return Err(anyhow!("unsupported output sample format {other}")),
    };
    stream.play()?;

    let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
    // ~500 ms ceiling so a stalled device cannot grow the queue forever
    let max_queued = rate as usize / 2;
    while running.load(Ordering::Relaxed) {
        let payload = match payloads.recv_timeout(Duration::from_millis(200)) {
            Ok(payload) => payload,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match decoder.decode(&payload, &mut pcm, false) {
            Ok(samples) => {
                let mut buf = buffer.lock().unwrap();
                buf.extend(&pcm[..samples]);
                while buf.len() > max_queued {
                    buf.pop_front();
                }
            }
            Err(err) => debug!("opus decode failed: {err}"),
        }
    }
    drop(stream);
    debug!("playback thread exiting");
    Ok(())
}
