//! Media proxy for FlowPBX
//!
//! Everything that touches RTP lives here: the bounded port pool, media
//! sessions with symmetric NAT learning and bidirectional relay, G.711
//! codecs (Opus behind the `opus` feature), RFC 2833 / SIP INFO DTMF
//! surfacing, the asynchronous WAV recorder, prompt playback, and the
//! N-way conference mixer.

pub mod codec;
pub mod dtmf;
pub mod error;
pub mod mixer;
pub mod player;
pub mod ports;
pub mod recorder;
pub mod rtp;
pub mod session;
pub mod wav;

pub use dtmf::{DtmfEvent, DtmfSource};
pub use error::{Error, Result};
pub use mixer::{ConferenceManager, Membership, RoomConfig};
pub use player::{play, PlayOutcome};
pub use ports::{PortPool, DEFAULT_PORT_MAX, DEFAULT_PORT_MIN};
pub use recorder::{Recorder, RecorderHandle};
pub use rtp::{RtpPacket, TelephoneEvent, FRAME_DURATION, FRAME_SAMPLES};
pub use session::{LegIo, MediaEngine, MediaSession, RtpStreamer, DTMF_PAYLOAD};
