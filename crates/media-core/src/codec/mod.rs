//! Audio codecs for the relay, recorder and mixer

pub mod g711;
#[cfg(feature = "opus")]
pub mod opus;

use crate::error::{Error, Result};

/// Stateful encoder/decoder between RTP payload bytes and 16-bit PCM at the
/// mixer's native 8 kHz mono format.
pub trait AudioCodec: Send {
    fn payload_type(&self) -> u8;

    /// Append decoded samples to `out`.
    fn decode(&mut self, payload: &[u8], out: &mut Vec<i16>) -> Result<()>;

    /// Append the encoded form of `samples` to `out`.
    fn encode(&mut self, samples: &[i16], out: &mut Vec<u8>) -> Result<()>;
}

/// Instantiate a codec for an RTP payload type.
pub fn for_payload(payload_type: u8) -> Result<Box<dyn AudioCodec>> {
    match payload_type {
        0 => Ok(Box::new(g711::G711::mulaw())),
        8 => Ok(Box::new(g711::G711::alaw())),
        #[cfg(feature = "opus")]
        111 => Ok(Box::new(opus::OpusCodec::new()?)),
        #[cfg(not(feature = "opus"))]
        111 => Err(Error::OpusUnavailable),
        other => Err(Error::UnsupportedPayload(other)),
    }
}

/// Whether the relay can bridge these payload types, either bytewise or by
/// transcoding.
pub fn bridgeable(a: u8, b: u8) -> bool {
    if a == b {
        return true;
    }
    let g711 = |pt: u8| pt == 0 || pt == 8;
    if g711(a) && g711(b) {
        return true;
    }
    // The G.711/Opus boundary needs a real Opus codec.
    cfg!(feature = "opus") && (g711(a) && b == 111 || a == 111 && g711(b))
}
