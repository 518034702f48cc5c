//! Default microphone [`Recorder`]: config-scoring and a
//! thread-affinity-wrapped `cpal::Stream`, generalized from
//! "write f32 into a ring buffer for a WAV writer" to "push s16le PCM
//! chunks into the engine's capture channel".

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat};

use super::{NegotiatedFormat, PcmSender, Recorder};
use crate::error::EngineError;

/// Wrapper to make `cpal::Stream` storable (it's `!Send`); only touched
/// from the thread that created it.
struct StreamHolder {
    stream: cpal::Stream,
    creator_thread: std::thread::ThreadId,
}
unsafe impl Send for StreamHolder {}

impl Drop for StreamHolder {
    fn drop(&mut self) {
        if std::thread::current().id() != self.creator_thread {
            log::warn!(
                "cpal stream dropped on a different thread than created \
                 (created: {:?}, dropping: {:?})",
                self.creator_thread,
                std::thread::current().id()
            );
        }
    }
}

/// Score a candidate config for how close it is to 16 kHz mono s16 — the
/// format every engine in this crate prefers.
fn config_score(cfg: &cpal::SupportedStreamConfigRange) -> i32 {
    let mut score = 0;
    if cfg.channels() == 1 {
        score += 100;
    } else if cfg.channels() == 2 {
        score += 50;
    }
    match cfg.sample_format() {
        SampleFormat::I16 => score += 50,
        SampleFormat::F32 => score += 40,
        _ => {}
    }
    let range = cfg.min_sample_rate().0..=cfg.max_sample_rate().0;
    if range.contains(&16_000) {
        score += 20;
    }
    score
}

fn select_best_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, EngineError> {
    let supported: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| EngineError::Media(format!("no supported input configs: {e}")))?
        .collect();

    let best = supported
        .iter()
        .max_by_key(|cfg| config_score(cfg))
        .ok_or_else(|| EngineError::Media("device exposes no input configs".to_string()))?;

    let range = best.min_sample_rate().0..=best.max_sample_rate().0;
    let rate = if range.contains(&16_000) {
        16_000
    } else {
        best.max_sample_rate().0
    };
    Ok(best.clone().with_sample_rate(cpal::SampleRate(rate)))
}

/// Build an input stream that converts every sample to i16 and pushes
/// little-endian bytes to `sink`, matching the "forward verbatim" step of
/// the capture pipeline (the conversion to a fixed PCM width happens once,
/// here, rather than downstream in every engine).
fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    active: Arc<AtomicBool>,
    sink: PcmSender,
) -> Result<cpal::Stream, EngineError>
where
    T: Sample + cpal::SizedSample + Send + 'static,
    i16: cpal::FromSample<T>,
{
    let err_fn = |err| log::error!("capture stream error: {err}");

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::SeqCst) {
                    return;
                }
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                    let mut bytes = Vec::with_capacity(data.len() * 2);
                    for s in data {
                        let v: i16 = i16::from_sample(*s);
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    let _ = sink.send(bytes);
                }));
                if result.is_err() {
                    log::warn!("capture callback panicked (known cpal/ALSA timing issue)");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| EngineError::Media(format!("failed to build input stream: {e}")))
}

pub struct CpalRecorder {
    active: Arc<AtomicBool>,
    stream: Option<StreamHolder>,
}

impl Default for CpalRecorder {
    fn default() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }
}

#[async_trait]
impl Recorder for CpalRecorder {
    async fn start(&mut self, _format: &str, sink: PcmSender) -> Result<NegotiatedFormat, EngineError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| EngineError::Media("no default input device".to_string()))?;
        let supported = select_best_config(&device)?;
        let channels = supported.channels();
        let rate = supported.sample_rate().0;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        self.active.store(true, Ordering::SeqCst);
        let active = self.active.clone();
        let stream = match sample_format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, active, sink)?,
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, active, sink)?,
            other => {
                return Err(EngineError::Media(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        };
        stream
            .play()
            .map_err(|e| EngineError::Media(format!("failed to start stream: {e}")))?;

        self.stream = Some(StreamHolder {
            stream,
            creator_thread: std::thread::current().id(),
        });

        Ok(NegotiatedFormat {
            container: format!("s16le, {rate} Hz, {channels} ch"),
        })
    }

    async fn close(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.stream = None;
    }
}
