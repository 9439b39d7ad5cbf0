//! Sample-format conversion. The distilled spec treats this as an external
//! pure function (`convert_pcm_frames(dst_fmt, src_fmt, frames, channels,
//! dither)`); this crate needs at least f32/s16/u8 concretely since leaf
//! nodes must interoperate with non-f32 `DataSource`s (§4.4: "if the source
//! format is not f32, convert into a stack buffer first").

use crate::data_source::SampleFormat;

/// Convert `src`, encoded as `src_fmt`, into `dst` as f32. `dst` must have
/// room for `sample_count` f32 samples (frames × channels, already
/// flattened). Dithering is intentionally not implemented — the distilled
/// spec names it as a parameter of the external collaborator, not a
/// behavior this crate must reproduce bit-for-bit.
pub fn convert_to_f32(dst: &mut [f32], src: &[u8], src_fmt: SampleFormat, sample_count: usize) {
    match src_fmt {
        SampleFormat::F32 => {
            for i in 0..sample_count {
                let bytes = [
                    src[i * 4],
                    src[i * 4 + 1],
                    src[i * 4 + 2],
                    src[i * 4 + 3],
                ];
                dst[i] = f32::from_le_bytes(bytes);
            }
        }
        SampleFormat::S16 => {
            for i in 0..sample_count {
                let bytes = [src[i * 2], src[i * 2 + 1]];
                let sample = i16::from_le_bytes(bytes);
                dst[i] = sample as f32 / 32768.0;
            }
        }
        SampleFormat::U8 => {
            for i in 0..sample_count {
                dst[i] = (src[i] as f32 - 128.0) / 128.0;
            }
        }
    }
}

/// Convert `src` (f32) into `dst_fmt`-encoded bytes. `dst` must have room for
/// `sample_count` samples of `dst_fmt`.
pub fn convert_from_f32(dst: &mut [u8], src: &[f32], dst_fmt: SampleFormat, sample_count: usize) {
    match dst_fmt {
        SampleFormat::F32 => {
            for i in 0..sample_count {
                let bytes = src[i].to_le_bytes();
                dst[i * 4..i * 4 + 4].copy_from_slice(&bytes);
            }
        }
        SampleFormat::S16 => {
            for i in 0..sample_count {
                let clamped = src[i].clamp(-1.0, 1.0);
                let sample = (clamped * 32767.0).round() as i16;
                dst[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
            }
        }
        SampleFormat::U8 => {
            for i in 0..sample_count {
                let clamped = src[i].clamp(-1.0, 1.0);
                dst[i] = ((clamped * 127.0) + 128.0).round() as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn s16_round_trips_within_one_lsb() {
        let original = [0.5f32, -0.5, 0.0, 1.0, -1.0];
        let mut encoded = vec![0u8; original.len() * 2];
        convert_from_f32(&mut encoded, &original, SampleFormat::S16, original.len());

        let mut decoded = vec![0f32; original.len()];
        convert_to_f32(&mut decoded, &encoded, SampleFormat::S16, original.len());

        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_float_eq!(*a, *b, abs <= 1.0 / 32767.0 + 1e-6);
        }
    }

    #[test]
    fn u8_midpoint_maps_near_zero() {
        let encoded = [128u8];
        let mut decoded = [0f32];
        convert_to_f32(&mut decoded, &encoded, SampleFormat::U8, 1);
        assert_float_eq!(decoded[0], 0.0, abs <= 1e-3);
    }
}
