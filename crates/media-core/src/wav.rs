//! Minimal WAV encode/decode for prompts, voicemail and call recordings
//!
//! Everything the PBX writes is PCM16 mono 8 kHz; reads additionally accept
//! stereo (downmixed) and 16 kHz (decimated) so user-uploaded prompts in
//! close formats still play.

use crate::error::{Error, Result};

pub const SAMPLE_RATE: u32 = 8_000;
const HEADER_LEN: usize = 44;

/// Render a complete WAV file for the given samples.
pub fn encode(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + samples.len() * 2);
    out.extend_from_slice(&header(samples.len() * 2));
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// The 44-byte canonical header for a PCM16 mono 8 kHz stream of
/// `data_len` bytes.
pub fn header(data_len: usize) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&((36 + data_len) as u32).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    h[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    h[22..24].copy_from_slice(&1u16.to_le_bytes()); // mono
    h[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    h[28..32].copy_from_slice(&(SAMPLE_RATE * 2).to_le_bytes()); // byte rate
    h[32..34].copy_from_slice(&2u16.to_le_bytes()); // block align
    h[34..36].copy_from_slice(&16u16.to_le_bytes()); // bits per sample
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&(data_len as u32).to_le_bytes());
    h
}

/// Decode a WAV file into 8 kHz mono samples.
pub fn decode(data: &[u8]) -> Result<Vec<i16>> {
    if data.len() < 12 || &data[..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(Error::WavFormat("not a RIFF/WAVE file".into()));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None; // format, channels, rate, bits
    let mut payload: Option<&[u8]> = None;
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let id = &data[offset..offset + 4];
        let len = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = (body_start + len).min(data.len());
        let body = &data[body_start..body_end];
        match id {
            b"fmt " if body.len() >= 16 => {
                fmt = Some((
                    u16::from_le_bytes([body[0], body[1]]),
                    u16::from_le_bytes([body[2], body[3]]),
                    u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    u16::from_le_bytes([body[14], body[15]]),
                ));
            }
            b"data" => payload = Some(body),
            _ => {}
        }
        // Chunks are word-aligned.
        offset = body_start + len + (len & 1);
    }

    let (format, channels, rate, bits) =
        fmt.ok_or_else(|| Error::WavFormat("missing fmt chunk".into()))?;
    let payload = payload.ok_or_else(|| Error::WavFormat("missing data chunk".into()))?;

    if format != 1 || bits != 16 {
        return Err(Error::WavFormat(format!(
            "only PCM16 is supported (format {format}, {bits} bits)"
        )));
    }
    if !(1..=2).contains(&channels) {
        return Err(Error::WavFormat(format!("{channels} channels")));
    }
    let decimate = match rate {
        8_000 => 1,
        16_000 => 2,
        other => return Err(Error::WavFormat(format!("unsupported rate {other} Hz"))),
    };

    let frame = channels as usize * 2;
    let samples = payload
        .chunks_exact(frame * decimate)
        .map(|chunk| {
            // Downmix the first frame of the decimation group.
            let mut acc = 0i32;
            for ch in 0..channels as usize {
                acc += i16::from_le_bytes([chunk[ch * 2], chunk[ch * 2 + 1]]) as i32;
            }
            (acc / channels as i32) as i16
        })
        .collect();
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let samples: Vec<i16> = (0..320).map(|i| (i * 97 % 2000) as i16 - 1000).collect();
        let encoded = encode(&samples);
        assert_eq!(&encoded[..4], b"RIFF");
        assert_eq!(encoded.len(), 44 + samples.len() * 2);
        assert_eq!(decode(&encoded).unwrap(), samples);
    }

    #[test]
    fn header_sizes_are_consistent() {
        let h = header(1600);
        assert_eq!(u32::from_le_bytes([h[4], h[5], h[6], h[7]]), 36 + 1600);
        assert_eq!(u32::from_le_bytes([h[40], h[41], h[42], h[43]]), 1600);
    }

    #[test]
    fn stereo_is_downmixed() {
        // Hand-build a stereo file with L=100, R=300 for every frame.
        let mut data = Vec::new();
        data.extend_from_slice(b"RIFF");
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"WAVE");
        data.extend_from_slice(b"fmt ");
        data.extend_from_slice(&16u32.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&8000u32.to_le_bytes());
        data.extend_from_slice(&32000u32.to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(b"data");
        data.extend_from_slice(&16u32.to_le_bytes());
        for _ in 0..4 {
            data.extend_from_slice(&100i16.to_le_bytes());
            data.extend_from_slice(&300i16.to_le_bytes());
        }
        assert_eq!(decode(&data).unwrap(), vec![200; 4]);
    }

    #[test]
    fn rejects_unsupported_formats() {
        assert!(decode(b"not a wav").is_err());
        let mut f = encode(&[0i16; 10]);
        f[24..28].copy_from_slice(&44100u32.to_le_bytes());
        assert!(decode(&f).is_err());
    }
}
