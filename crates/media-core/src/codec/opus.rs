//! Opus codec wrapper (feature `opus`)
//!
//! Bridges Opus at 48 kHz stereo on the wire to the engine's 8 kHz mono
//! PCM frames. Resampling is plain 6:1 decimation/replication, which is
//! adequate for narrowband telephony audio.

use crate::codec::AudioCodec;
use crate::error::{Error, Result};

const WIRE_RATE_FACTOR: usize = 6; // 48 kHz wire / 8 kHz engine
const ENGINE_FRAME: usize = 160; // 20 ms at 8 kHz

pub struct OpusCodec {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
    wire_buf: Vec<i16>,
}

impl OpusCodec {
    pub fn new() -> Result<Self> {
        let encoder =
            opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| Error::Codec(e.to_string()))?;
        let decoder = opus::Decoder::new(48_000, opus::Channels::Mono)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(OpusCodec {
            encoder,
            decoder,
            wire_buf: vec![0i16; ENGINE_FRAME * WIRE_RATE_FACTOR],
        })
    }
}

impl AudioCodec for OpusCodec {
    fn payload_type(&self) -> u8 {
        111
    }

    fn decode(&mut self, payload: &[u8], out: &mut Vec<i16>) -> Result<()> {
        let decoded = self
            .decoder
            .decode(payload, &mut self.wire_buf, false)
            .map_err(|e| Error::Codec(e.to_string()))?;
        out.reserve(decoded / WIRE_RATE_FACTOR);
        out.extend(
            self.wire_buf[..decoded]
                .chunks(WIRE_RATE_FACTOR)
                .map(|chunk| chunk[0]),
        );
        Ok(())
    }

    fn encode(&mut self, samples: &[i16], out: &mut Vec<u8>) -> Result<()> {
        self.wire_buf.clear();
        for &sample in samples {
            for _ in 0..WIRE_RATE_FACTOR {
                self.wire_buf.push(sample);
            }
        }
        let mut encoded = vec![0u8; 4000];
        let len = self
            .encoder
            .encode(&self.wire_buf, &mut encoded)
            .map_err(|e| Error::Codec(e.to_string()))?;
        out.extend_from_slice(&encoded[..len]);
        Ok(())
    }
}
