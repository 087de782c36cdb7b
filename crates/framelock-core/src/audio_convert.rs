//! Codec audio to sink PCM.
//!
//! Produces interleaved signed 16-bit samples. Sources with more than two
//! channels are reduced to stereo by keeping the front left/right pair
//! (channels 0 and 1); the remaining channels are dropped.

use crate::audio::{AudioError, AudioFormat, AudioFrame, AudioSamples, SampleFormat};

/// Maximum channel count pushed to a sink.
pub const MAX_OUTPUT_CHANNELS: u16 = 2;

/// Output layout for a source with `channels` channels at `sample_rate`.
pub fn output_format(sample_rate: u32, channels: u16) -> AudioFormat {
    AudioFormat::s16(sample_rate, channels.clamp(1, MAX_OUTPUT_CHANNELS))
}

/// Converts one decoded frame into sink PCM.
///
/// `start_pts` is the audio stream's first timestamp, so that
/// [`AudioSamples::start_seconds`] lines up with the video timeline.
pub fn to_pcm(frame: &AudioFrame, start_pts: i64) -> Result<AudioSamples, AudioError> {
    let in_channels = frame.channels as usize;
    if in_channels == 0 || frame.sample_rate == 0 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} channels at {}Hz",
            frame.channels, frame.sample_rate
        )));
    }
    let expected_planes = if frame.planar { in_channels } else { 1 };
    let bps = frame.format.bytes_per_sample();
    let plane_len = if frame.planar {
        frame.samples * bps
    } else {
        frame.samples * bps * in_channels
    };
    if frame.planes.len() < expected_planes || frame.planes.iter().any(|p| p.len() < plane_len) {
        return Err(AudioError::UnsupportedFormat(format!(
            "{:?} frame with {} planes is shorter than {} samples",
            frame.format,
            frame.planes.len(),
            frame.samples
        )));
    }

    let format = output_format(frame.sample_rate, frame.channels);
    let out_channels = format.channels as usize;
    let mut data = Vec::with_capacity(frame.samples * out_channels * 2);

    for n in 0..frame.samples {
        for ch in 0..out_channels {
            let (plane, offset) = if frame.planar {
                (&frame.planes[ch], n * bps)
            } else {
                (&frame.planes[0], (n * in_channels + ch) * bps)
            };
            let sample = read_s16(frame.format, &plane[offset..offset + bps]);
            data.extend_from_slice(&sample.to_le_bytes());
        }
    }

    Ok(AudioSamples {
        data,
        format,
        start_seconds: frame.start_seconds(start_pts),
    })
}

fn read_s16(format: SampleFormat, bytes: &[u8]) -> i16 {
    match format {
        SampleFormat::U8 => ((bytes[0] as i16) - 128) << 8,
        SampleFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]),
        SampleFormat::S32 => {
            (i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) >> 16) as i16
        }
        SampleFormat::F32 => {
            float_to_s16(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)
        }
        SampleFormat::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            float_to_s16(f64::from_le_bytes(raw))
        }
    }
}

fn float_to_s16(v: f64) -> i16 {
    (v.clamp(-1.0, 1.0) * i16::MAX as f64).round() as i16
}

/// Converts interleaved S16 PCM into normalized f32 samples.
pub fn s16_to_f32(pcm: &[u8]) -> impl Iterator<Item = f32> + '_ {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Rational;

    fn frame(format: SampleFormat, planar: bool, channels: u16, planes: Vec<Vec<u8>>, samples: usize) -> AudioFrame {
        AudioFrame {
            pts: Some(480),
            time_base: Rational::new(1, 48000),
            sample_rate: 48000,
            channels,
            format,
            planar,
            samples,
            planes,
        }
    }

    fn s16_values(samples: &AudioSamples) -> Vec<i16> {
        samples
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_planar_f32_interleaves() {
        let left: Vec<u8> = [0.5f32, -1.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let right: Vec<u8> = [0.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let Ok(out) = to_pcm(&frame(SampleFormat::F32, true, 2, vec![left, right], 2), 0) else {
            panic!("conversion failed");
        };
        assert_eq!(out.format, AudioFormat::s16(48000, 2));
        assert_eq!(s16_values(&out), vec![16384, 0, -32767, 32767]);
        assert_eq!(out.start_seconds, Some(0.01));
    }

    #[test]
    fn test_surround_downmixes_to_front_pair() {
        let interleaved: Vec<u8> = [1i16, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let Ok(out) = to_pcm(&frame(SampleFormat::S16, false, 6, vec![interleaved], 2), 480) else {
            panic!("conversion failed");
        };
        assert_eq!(out.format.channels, 2);
        assert_eq!(s16_values(&out), vec![1, 2, 7, 8]);
        assert_eq!(out.start_seconds, Some(0.0));
    }

    #[test]
    fn test_u8_and_s32() {
        let Ok(out) = to_pcm(&frame(SampleFormat::U8, false, 1, vec![vec![128, 255, 0]], 3), 0) else {
            panic!("conversion failed");
        };
        assert_eq!(s16_values(&out), vec![0, 127 << 8, -128 << 8]);

        let raw: Vec<u8> = [i32::MAX, i32::MIN].iter().flat_map(|v| v.to_le_bytes()).collect();
        let Ok(out) = to_pcm(&frame(SampleFormat::S32, false, 1, vec![raw], 2), 0) else {
            panic!("conversion failed");
        };
        assert_eq!(s16_values(&out), vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_short_plane_rejected() {
        let result = to_pcm(&frame(SampleFormat::S16, true, 2, vec![vec![0; 4]], 2), 0);
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_s16_to_f32() {
        let pcm: Vec<u8> = [i16::MAX, 0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let values: Vec<f32> = s16_to_f32(&pcm).collect();
        assert_eq!(values, vec![1.0, 0.0]);
    }
}
