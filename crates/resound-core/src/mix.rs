use crate::memory::MemChunk;
use crate::sample::{SampleFormat, SampleSpec};
use crate::volume::{CVolume, Volume};

/// One stream's contribution to a mix: the chunk it peeked and the gain it
/// asked for.
#[derive(Debug)]
pub struct MixInfo {
    pub chunk: MemChunk,
    pub volume: CVolume,
}

/// Mixes `streams` into `out` applying per-stream gain and the global soft
/// volume, saturating integer formats. Returns the number of bytes written:
/// the frame-aligned minimum of the stream chunks and `out`.
pub fn mix(
    streams: &[MixInfo],
    spec: &SampleSpec,
    soft_volume: &CVolume,
    soft_muted: bool,
    out: &mut [u8],
) -> usize {
    assert!(!streams.is_empty());

    let mut length = out.len();
    for stream in streams {
        length = length.min(stream.chunk.length);
    }
    let length = spec.frame_align(length);
    if length == 0 {
        return 0;
    }

    let out = &mut out[..length];

    if soft_muted || soft_volume.is_muted() {
        out.fill(spec.format.silence_byte());
        return length;
    }

    let channels = spec.channels as usize;

    // Per-stream, per-channel linear factors with the soft volume folded in.
    let factors: Vec<Vec<u32>> = streams
        .iter()
        .map(|stream| {
            debug_assert_eq!(stream.volume.len(), channels);
            (0..channels)
                .map(|c| stream.volume.get(c).multiply(soft_volume.get(c)).raw())
                .collect()
        })
        .collect();

    let sources: Vec<&[u8]> = streams.iter().map(|s| s.chunk.as_slice()).collect();

    match spec.format {
        SampleFormat::U8 => {
            for (i, sample) in out.iter_mut().enumerate() {
                let c = i % channels;
                let mut sum: i64 = 0;
                for (src, f) in sources.iter().zip(&factors) {
                    let centered = src[i] as i64 - 0x80;
                    sum += centered * f[c] as i64 >> 16;
                }
                *sample = (sum.clamp(-0x80, 0x7f) + 0x80) as u8;
            }
        }
        SampleFormat::S16 => {
            for i in 0..length / 2 {
                let c = i % channels;
                let mut sum: i64 = 0;
                for (src, f) in sources.iter().zip(&factors) {
                    let sample = i16::from_ne_bytes([src[i * 2], src[i * 2 + 1]]) as i64;
                    sum += sample * f[c] as i64 >> 16;
                }
                let sample = sum.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                out[i * 2..i * 2 + 2].copy_from_slice(&sample.to_ne_bytes());
            }
        }
        SampleFormat::F32 => {
            for i in 0..length / 4 {
                let c = i % channels;
                let mut sum = 0.0f32;
                for (src, f) in sources.iter().zip(&factors) {
                    let bytes = [src[i * 4], src[i * 4 + 1], src[i * 4 + 2], src[i * 4 + 3]];
                    let sample = f32::from_ne_bytes(bytes);
                    sum += sample * (f[c] as f32 / Volume::NORM.raw() as f32);
                }
                out[i * 4..i * 4 + 4].copy_from_slice(&sum.to_ne_bytes());
            }
        }
    }

    length
}

/// In-place gain; a no-op at unity. Unshares the chunk before writing.
pub fn apply_volume(chunk: &mut MemChunk, spec: &SampleSpec, volume: &CVolume) {
    if volume.is_norm() {
        return;
    }

    if volume.is_muted() {
        silence(chunk, spec);
        return;
    }

    let channels = spec.channels as usize;
    debug_assert_eq!(volume.len(), channels);

    let data = chunk.as_mut_slice();

    match spec.format {
        SampleFormat::U8 => {
            for (i, sample) in data.iter_mut().enumerate() {
                let f = volume.get(i % channels).raw() as i64;
                let centered = *sample as i64 - 0x80;
                *sample = ((centered * f >> 16).clamp(-0x80, 0x7f) + 0x80) as u8;
            }
        }
        SampleFormat::S16 => {
            for i in 0..data.len() / 2 {
                let f = volume.get(i % channels).raw() as i64;
                let sample = i16::from_ne_bytes([data[i * 2], data[i * 2 + 1]]) as i64;
                let scaled = (sample * f >> 16).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                data[i * 2..i * 2 + 2].copy_from_slice(&scaled.to_ne_bytes());
            }
        }
        SampleFormat::F32 => {
            for i in 0..data.len() / 4 {
                let f = volume.get(i % channels).raw() as f32 / Volume::NORM.raw() as f32;
                let bytes = [data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]];
                let scaled = f32::from_ne_bytes(bytes) * f;
                data[i * 4..i * 4 + 4].copy_from_slice(&scaled.to_ne_bytes());
            }
        }
    }
}

pub fn silence(chunk: &mut MemChunk, spec: &SampleSpec) {
    chunk.as_mut_slice().fill(spec.format.silence_byte());
}
