//! Chunk decoding: encoded bytes in, mono PCM at the output rate out.
//!
//! RIFF/WAVE payloads take a `hound` fast path; everything else (MP3, OGG,
//! FLAC, ...) is probed and decoded with symphonia. Multi-channel audio is
//! averaged down to mono, then converted to the output rate.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::audio::resample::resample;
use crate::buffering::PcmBuffer;
use crate::error::{PrompterError, Result};

/// Decode one chunk and convert it to `target_rate`.
///
/// # Errors
/// `PrompterError::Decode` for empty, truncated, or unsupported payloads.
pub fn decode_chunk(bytes: &[u8], target_rate: u32) -> Result<PcmBuffer> {
    if bytes.is_empty() {
        return Err(PrompterError::Decode("empty chunk".into()));
    }
    let pcm = if is_riff_wave(bytes) {
        decode_wav(bytes)?
    } else {
        decode_compressed(bytes)?
    };
    if pcm.is_empty() {
        return Err(PrompterError::Decode("chunk contained no audio frames".into()));
    }
    resample(pcm, target_rate)
}

fn is_riff_wave(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8]) -> Result<PcmBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PrompterError::Decode(format!("wav header: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, hound::Error>>(),
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>()
        }
    }
    .map_err(|e| PrompterError::Decode(format!("wav samples: {e}")))?;

    Ok(PcmBuffer::new(downmix(&interleaved, channels), spec.sample_rate))
}

fn decode_compressed(bytes: &[u8]) -> Result<PcmBuffer> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PrompterError::Decode(format!("unsupported audio format: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PrompterError::Decode("no supported audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| PrompterError::Decode("unknown sample rate".into()))?;
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(1).max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| PrompterError::Decode(format!("unsupported codec: {e}")))?;

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut interleaved: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(PrompterError::Decode(format!("reading packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => {
                debug!("skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(PrompterError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        let frames = decoded.capacity();
        let sbuf = sample_buf.get_or_insert_with(|| SampleBuffer::<f32>::new(frames as u64, spec));
        if sbuf.capacity() < frames {
            *sbuf = SampleBuffer::<f32>::new(frames as u64, spec);
        }
        sbuf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(sbuf.samples());
    }

    Ok(PcmBuffer::new(downmix(&interleaved, channels), sample_rate))
}

/// Average interleaved frames down to one channel.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn wav(spec: hound::WavSpec, write: impl FnOnce(&mut hound::WavWriter<Cursor<&mut Vec<u8>>>)) -> Vec<u8> {
        let mut bytes = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
            write(&mut writer);
            writer.finalize().unwrap();
        }
        bytes
    }

    #[test]
    fn int16_stereo_wav_is_downmixed() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav(spec, |w| {
            for _ in 0..160 {
                w.write_sample(16_384i16).unwrap();
                w.write_sample(0i16).unwrap();
            }
        });
        let pcm = decode_chunk(&bytes, 16_000).unwrap();
        assert_eq!(pcm.samples.len(), 160);
        assert_relative_eq!(pcm.samples[0], 0.25);
    }

    #[test]
    fn float_wav_is_resampled_to_target() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 24_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let bytes = wav(spec, |w| {
            for _ in 0..2_400 {
                w.write_sample(0.1f32).unwrap();
            }
        });
        let pcm = decode_chunk(&bytes, 48_000).unwrap();
        assert_eq!(pcm.sample_rate, 48_000);
        assert_eq!(pcm.samples.len(), 4_800);
    }

    #[test]
    fn garbage_and_empty_chunks_fail_cleanly() {
        assert!(matches!(decode_chunk(&[], 48_000), Err(PrompterError::Decode(_))));
        assert!(matches!(
            decode_chunk(b"definitely not audio", 48_000),
            Err(PrompterError::Decode(_))
        ));
    }

    #[test]
    fn truncated_wav_header_fails() {
        assert!(decode_chunk(b"RIFF\x10\0\0\0WAVEfmt ", 48_000).is_err());
    }
}
