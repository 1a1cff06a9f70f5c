//! Media sessions and the packet relay
//!
//! A session owns one or two legs. Each leg is a bound RTP/RTCP socket pair
//! whose remote endpoint is learned symmetrically: the first non-empty
//! packet seen on the RTP socket commits its source address for the rest of
//! the session, and packets from any other source are dropped and counted.
//!
//! Wiring decides what happens to received audio: dropped (signaling-only
//! phases and prompt playback), relayed to the other leg (bridged calls,
//! bytewise when the payload types match, transcoded across the G.711/Opus
//! boundary otherwise), or fed to a conference mixer. DTMF telephone-events
//! and an optional recorder fork apply in every mode.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::{self, AudioCodec};
use crate::dtmf::{DtmfDetector, DtmfEvent};
use crate::error::{Error, Result};
use crate::ports::{PortPair, PortPool};
use crate::recorder::RecorderHandle;
use crate::rtp::{RtpHeader, RtpPacket, TelephoneEvent, FRAME_SAMPLES};

/// Telephone-event payload number.
pub const DTMF_PAYLOAD: u8 = 101;

/// One side of a media session.
pub struct LegIo {
    ports: PortPair,
    remote: OnceLock<SocketAddr>,
    payload: u8,
    rejected: AtomicU64,
}

impl LegIo {
    fn new(ports: PortPair, payload: u8) -> Self {
        LegIo {
            ports,
            remote: OnceLock::new(),
            payload,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn rtp_port(&self) -> u16 {
        self.ports.rtp_port()
    }

    /// Negotiated audio payload type for this leg.
    pub fn payload_type(&self) -> u8 {
        self.payload
    }

    /// The committed remote endpoint, if learned.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    /// Pre-commit the remote endpoint from SDP. Symmetric learning wins if
    /// a packet arrives first; after either commit the remote is immutable.
    pub fn hint_remote(&self, addr: SocketAddr) {
        let _ = self.remote.set(addr);
    }

    /// Packets dropped for arriving from a source other than the committed
    /// remote.
    pub fn rejected_packets(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Apply symmetric learning to a packet source. Returns false when the
    /// packet must be dropped.
    fn observe_source(&self, source: SocketAddr) -> bool {
        match self.remote.get() {
            None => {
                let committed = *self.remote.get_or_init(|| source);
                if committed == source {
                    debug!(%source, port = self.rtp_port(), "committed remote endpoint");
                }
                committed == source
            }
            Some(committed) if *committed == source => true,
            Some(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Send raw wire bytes to the learned remote. Silently skipped until
    /// learning commits.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        if let Some(remote) = self.remote.get() {
            self.ports.rtp_socket().send_to(bytes, *remote).await?;
        }
        Ok(())
    }

    async fn send_rtcp(&self, bytes: &[u8]) -> Result<()> {
        if let Some(remote) = self.remote.get() {
            let rtcp_remote = SocketAddr::new(remote.ip(), remote.port().wrapping_add(1));
            self.ports.rtcp_socket().send_to(bytes, rtcp_remote).await?;
        }
        Ok(())
    }
}

/// Outgoing RTP stream state for one leg (prompts, mixer output,
/// transcoded relay).
pub struct RtpStreamer {
    leg: Arc<LegIo>,
    codec: Box<dyn AudioCodec>,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    scratch: Vec<u8>,
}

impl RtpStreamer {
    pub fn new(leg: Arc<LegIo>) -> Result<Self> {
        let codec = codec::for_payload(leg.payload_type())?;
        let mut rng = rand::thread_rng();
        Ok(RtpStreamer {
            leg,
            codec,
            sequence: rng.gen(),
            timestamp: rng.gen(),
            ssrc: rng.gen(),
            scratch: Vec::with_capacity(FRAME_SAMPLES),
        })
    }

    fn serves(&self, leg: &Arc<LegIo>) -> bool {
        Arc::ptr_eq(&self.leg, leg)
    }

    /// Encode and send one 20 ms frame of PCM.
    pub async fn send_frame(&mut self, samples: &[i16]) -> Result<()> {
        self.scratch.clear();
        self.codec.encode(samples, &mut self.scratch)?;
        let packet = RtpPacket {
            header: RtpHeader {
                payload_type: self.leg.payload_type(),
                marker: false,
                sequence: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
            },
            payload: bytes::Bytes::copy_from_slice(&self.scratch),
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples.len() as u32);
        self.leg.send_raw(&packet.to_bytes()).await
    }
}

/// Where received audio goes.
#[derive(Clone)]
pub enum Wiring {
    /// Drop audio; DTMF and recording still apply.
    Idle,
    /// Forward between the two legs.
    Bridge,
    /// Feed decoded caller audio to a conference mixer, tagged with the
    /// member id.
    Mixer {
        member: Uuid,
        frames: mpsc::Sender<(Uuid, Vec<i16>)>,
    },
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub relayed_packets: AtomicU64,
    pub relayed_bytes: AtomicU64,
}

/// Allocates sessions against the shared port pool.
#[derive(Clone)]
pub struct MediaEngine {
    pool: PortPool,
    advertise_ip: IpAddr,
}

impl MediaEngine {
    pub fn new(pool: PortPool, advertise_ip: IpAddr) -> Self {
        MediaEngine { pool, advertise_ip }
    }

    /// Address written into SDP the PBX emits.
    pub fn advertise_ip(&self) -> IpAddr {
        self.advertise_ip
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    /// Allocate a session with its caller-side leg.
    pub async fn create_session(&self, caller_payload: u8) -> Result<Arc<MediaSession>> {
        let ports = self.pool.allocate().await?;
        Ok(MediaSession::start(self.clone(), ports, caller_payload))
    }
}

type CalleeSlot = Arc<Mutex<Option<Arc<LegIo>>>>;

/// A fork candidate leg and the loops serving it.
struct ForkLeg {
    leg: Arc<LegIo>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// A live media session.
pub struct MediaSession {
    id: Uuid,
    engine: MediaEngine,
    caller: Arc<LegIo>,
    callee: CalleeSlot,
    fork_legs: Mutex<Vec<ForkLeg>>,
    wiring_tx: watch::Sender<Wiring>,
    detector: Arc<Mutex<DtmfDetector>>,
    dtmf_rx: Mutex<Option<mpsc::Receiver<DtmfEvent>>>,
    recorder: Arc<Mutex<Option<RecorderHandle>>>,
    stats: Arc<SessionStats>,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MediaSession {
    fn start(engine: MediaEngine, caller_ports: PortPair, caller_payload: u8) -> Arc<Self> {
        let (detector, dtmf_rx) = DtmfDetector::channel(32);
        let (wiring_tx, _) = watch::channel(Wiring::Idle);
        let (closed_tx, _) = watch::channel(false);

        let session = Arc::new(MediaSession {
            id: Uuid::new_v4(),
            engine,
            caller: Arc::new(LegIo::new(caller_ports, caller_payload)),
            callee: Arc::new(Mutex::new(None)),
            fork_legs: Mutex::new(Vec::new()),
            wiring_tx,
            detector: Arc::new(Mutex::new(detector)),
            dtmf_rx: Mutex::new(Some(dtmf_rx)),
            recorder: Arc::new(Mutex::new(None)),
            stats: Arc::new(SessionStats::default()),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        });
        session.spawn_leg_loops(session.caller.clone(), LegSide::Caller);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Caller-side leg (towards the party that opened the session).
    pub fn caller_leg(&self) -> Arc<LegIo> {
        self.caller.clone()
    }

    pub fn callee_leg(&self) -> Option<Arc<LegIo>> {
        self.callee.lock().clone()
    }

    /// Take the DTMF receiver; the flow engine holds it for the call.
    pub fn take_dtmf(&self) -> Option<mpsc::Receiver<DtmfEvent>> {
        self.dtmf_rx.lock().take()
    }

    /// Surface a digit that arrived via SIP INFO.
    pub fn inject_info_digit(&self, digit: char, timestamp: u32) {
        self.detector.lock().on_info_digit(digit, timestamp);
    }

    /// Attach the callee-side leg, allocating its port pair. Returns the
    /// leg so its port can be advertised in the outgoing SDP offer.
    pub async fn attach_callee(&self, payload: u8) -> Result<Arc<LegIo>> {
        if !codec::bridgeable(self.caller.payload_type(), payload) {
            return Err(Error::UnsupportedPayload(payload));
        }
        let ports = self.engine.pool.allocate().await?;
        let leg = Arc::new(LegIo::new(ports, payload));
        let previous = self.callee.lock().replace(leg.clone());
        if previous.is_some() {
            warn!(session = %self.id, "replacing existing callee leg");
        }
        self.spawn_leg_loops(leg.clone(), LegSide::Callee);
        Ok(leg)
    }

    /// Allocate a candidate callee leg for one fork of a ringing attempt.
    /// Each child INVITE advertises its own leg; none of them relays until
    /// one is promoted.
    pub async fn attach_fork_leg(&self, payload: u8) -> Result<Arc<LegIo>> {
        if !codec::bridgeable(self.caller.payload_type(), payload) {
            return Err(Error::UnsupportedPayload(payload));
        }
        let ports = self.engine.pool.allocate().await?;
        let leg = Arc::new(LegIo::new(ports, payload));
        let tasks = self.spawn_callee_tasks(leg.clone());
        self.fork_legs.lock().push(ForkLeg {
            leg: leg.clone(),
            tasks,
        });
        Ok(leg)
    }

    /// Make `leg` the active callee and start relaying; every other fork
    /// candidate is torn down and its ports released.
    pub fn promote_fork_leg(&self, leg: &Arc<LegIo>) {
        let mut forks = self.fork_legs.lock();
        let mut found = false;
        for fork in forks.drain(..) {
            if Arc::ptr_eq(&fork.leg, leg) {
                found = true;
                self.callee.lock().replace(fork.leg.clone());
                self.tasks.lock().extend(fork.tasks);
            } else {
                for task in fork.tasks {
                    task.abort();
                }
            }
        }
        drop(forks);
        if found {
            self.bridge();
        } else {
            warn!(session = %self.id, "promoted leg is not a fork candidate");
        }
    }

    /// Drop every unpromoted fork candidate (ring attempt over).
    pub fn clear_fork_legs(&self) {
        for fork in self.fork_legs.lock().drain(..) {
            for task in fork.tasks {
                task.abort();
            }
        }
    }

    /// Start forwarding between the two legs.
    pub fn bridge(&self) {
        let _ = self.wiring_tx.send(Wiring::Bridge);
    }

    /// Feed the caller leg's decoded audio to a mixer as `member`.
    pub fn join_mixer(&self, member: Uuid, frames: mpsc::Sender<(Uuid, Vec<i16>)>) {
        let _ = self.wiring_tx.send(Wiring::Mixer { member, frames });
    }

    /// Back to dropping audio (e.g. after leaving a conference).
    pub fn unwire(&self) {
        let _ = self.wiring_tx.send(Wiring::Idle);
    }

    /// Attach a recording fork.
    pub fn set_recorder(&self, handle: RecorderHandle) {
        *self.recorder.lock() = Some(handle);
    }

    /// Detach the recording fork, returning it so the owner can flush the
    /// recording.
    pub fn take_recorder(&self) -> Option<RecorderHandle> {
        self.recorder.lock().take()
    }

    /// A streamer for pushing generated audio (prompts, tones) to a leg.
    pub fn streamer_for(&self, leg: Arc<LegIo>) -> Result<RtpStreamer> {
        RtpStreamer::new(leg)
    }

    /// Stop every loop and release all port pairs. Idempotent; ports are
    /// back in the pool when this returns.
    pub async fn shutdown(&self) {
        let _ = self.closed_tx.send(true);
        self.clear_fork_legs();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.callee.lock().take();
        trace!(session = %self.id, "media session shut down");
    }

    fn spawn_leg_loops(&self, leg: Arc<LegIo>, side: LegSide) {
        let tasks = self.build_leg_tasks(leg, side);
        self.tasks.lock().extend(tasks);
    }

    fn spawn_callee_tasks(&self, leg: Arc<LegIo>) -> Vec<tokio::task::JoinHandle<()>> {
        self.build_leg_tasks(leg, LegSide::Callee)
    }

    fn build_leg_tasks(&self, leg: Arc<LegIo>, side: LegSide) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(rtp_loop(LoopContext {
                leg: leg.clone(),
                side,
                caller: self.caller.clone(),
                callee: self.callee.clone(),
                wiring: self.wiring_tx.subscribe(),
                closed: self.closed_tx.subscribe(),
                detector: self.detector.clone(),
                recorder: self.recorder.clone(),
                stats: self.stats.clone(),
            })),
            tokio::spawn(rtcp_loop(
                leg,
                side,
                self.caller.clone(),
                self.callee.clone(),
                self.closed_tx.subscribe(),
            )),
        ]
    }
}

/// Which side of the session a loop serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegSide {
    Caller,
    Callee,
}

struct LoopContext {
    leg: Arc<LegIo>,
    side: LegSide,
    caller: Arc<LegIo>,
    callee: CalleeSlot,
    wiring: watch::Receiver<Wiring>,
    closed: watch::Receiver<bool>,
    detector: Arc<Mutex<DtmfDetector>>,
    recorder: Arc<Mutex<Option<RecorderHandle>>>,
    stats: Arc<SessionStats>,
}

impl LoopContext {
    /// The leg packets received here are forwarded to.
    fn peer(&self) -> Option<Arc<LegIo>> {
        match self.side {
            LegSide::Caller => self.callee.lock().clone(),
            LegSide::Callee => Some(self.caller.clone()),
        }
    }
}

/// Per-direction transcoding pipeline, created lazily when a bridged pair
/// of legs disagrees on payload type.
struct Transcoder {
    decoder: Box<dyn AudioCodec>,
    streamer: RtpStreamer,
    pcm: Vec<i16>,
}

impl Transcoder {
    fn new(from_payload: u8, to_leg: Arc<LegIo>) -> Result<Self> {
        Ok(Transcoder {
            decoder: codec::for_payload(from_payload)?,
            streamer: RtpStreamer::new(to_leg)?,
            pcm: Vec::with_capacity(FRAME_SAMPLES),
        })
    }

    async fn forward(&mut self, payload: &[u8]) -> Result<()> {
        self.pcm.clear();
        self.decoder.decode(payload, &mut self.pcm)?;
        let pcm = std::mem::take(&mut self.pcm);
        self.streamer.send_frame(&pcm).await?;
        self.pcm = pcm;
        Ok(())
    }
}

/// Receive loop for one leg's RTP socket.
async fn rtp_loop(mut ctx: LoopContext) {
    let mut buf = vec![0u8; 2048];
    let mut transcoder: Option<Transcoder> = None;
    // Decoder reused for the recorder/mixer fork.
    let mut fork_decoder: Option<Box<dyn AudioCodec>> = None;
    let mut fork_pcm: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);

    loop {
        let rtp_socket = ctx.leg.ports.rtp_socket();
        let (len, source) = tokio::select! {
            biased;
            _ = ctx.closed.changed() => break,
            received = rtp_socket.recv_from(&mut buf) => match received {
                Ok(ok) => ok,
                Err(err) => {
                    trace!("rtp recv error: {err}");
                    break;
                }
            },
        };
        // Zero-length datagrams are NAT keep-alives; they neither commit
        // learning nor carry media.
        if len == 0 {
            continue;
        }
        if !ctx.leg.observe_source(source) {
            continue;
        }
        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("dropping bad RTP from {source}: {err}");
                continue;
            }
        };

        let is_dtmf = packet.header.payload_type == DTMF_PAYLOAD;
        if is_dtmf {
            if let Ok(event) = TelephoneEvent::parse(&packet.payload) {
                ctx.detector
                    .lock()
                    .on_telephone_event(event, packet.header.timestamp);
            }
        }

        let wiring = ctx.wiring.borrow().clone();
        match wiring {
            Wiring::Idle => {}
            Wiring::Bridge => {
                if let Some(peer) = ctx.peer() {
                    let outcome = if is_dtmf || peer.payload_type() == ctx.leg.payload_type() {
                        // Bytewise relay: the wire bytes go out unchanged.
                        peer.send_raw(&buf[..len]).await
                    } else {
                        if !transcoder
                            .as_ref()
                            .map(|t| t.streamer.serves(&peer))
                            .unwrap_or(false)
                        {
                            transcoder = match Transcoder::new(ctx.leg.payload_type(), peer.clone())
                            {
                                Ok(t) => Some(t),
                                Err(err) => {
                                    warn!("cannot transcode: {err}");
                                    continue;
                                }
                            };
                        }
                        match transcoder.as_mut() {
                            Some(t) => t.forward(&packet.payload).await,
                            None => Ok(()),
                        }
                    };
                    match outcome {
                        Ok(()) => {
                            ctx.stats.relayed_packets.fetch_add(1, Ordering::Relaxed);
                            ctx.stats
                                .relayed_bytes
                                .fetch_add(len as u64, Ordering::Relaxed);
                        }
                        Err(err) => trace!("relay send failed: {err}"),
                    }
                }
            }
            Wiring::Mixer { member, frames } => {
                if !is_dtmf && ctx.side == LegSide::Caller {
                    if let Some(pcm) = decode_fork(
                        &mut fork_decoder,
                        &mut fork_pcm,
                        ctx.leg.payload_type(),
                        &packet.payload,
                    ) {
                        let _ = frames.try_send((member, pcm));
                    }
                }
            }
        }

        // Recording fork: decoded PCM of everything that arrives on this
        // leg, in every wiring mode.
        if !is_dtmf {
            let recorder = ctx.recorder.lock().clone();
            if let Some(recorder) = recorder {
                if let Some(pcm) = decode_fork(
                    &mut fork_decoder,
                    &mut fork_pcm,
                    ctx.leg.payload_type(),
                    &packet.payload,
                ) {
                    recorder.push(pcm);
                }
            }
        }
    }
}

fn decode_fork(
    decoder: &mut Option<Box<dyn AudioCodec>>,
    pcm: &mut Vec<i16>,
    payload_type: u8,
    payload: &[u8],
) -> Option<Vec<i16>> {
    if decoder.is_none() {
        *decoder = codec::for_payload(payload_type).ok();
    }
    let decoder = decoder.as_mut()?;
    pcm.clear();
    decoder.decode(payload, pcm).ok()?;
    Some(pcm.clone())
}

/// RTCP companion loop: forward control packets between legs on rtp+1.
async fn rtcp_loop(
    leg: Arc<LegIo>,
    side: LegSide,
    caller: Arc<LegIo>,
    callee: CalleeSlot,
    mut closed: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let rtcp_socket = leg.ports.rtcp_socket();
        let len = tokio::select! {
            biased;
            _ = closed.changed() => break,
            received = rtcp_socket.recv_from(&mut buf) => match received {
                Ok((len, _source)) => len,
                Err(_) => break,
            },
        };
        if len == 0 {
            continue;
        }
        let peer = match side {
            LegSide::Caller => callee.lock().clone(),
            LegSide::Callee => Some(caller.clone()),
        };
        if let Some(peer) = peer {
            let _ = peer.send_rtcp(&buf[..len]).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    fn engine() -> MediaEngine {
        MediaEngine::new(
            PortPool::new("127.0.0.1".parse().unwrap(), 41_000, 41_099),
            "127.0.0.1".parse().unwrap(),
        )
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn symmetric_learning_commits_and_rejects() {
        let session = engine().create_session(8).await.unwrap();
        let leg = session.caller_leg();
        let target = format!("127.0.0.1:{}", leg.rtp_port());

        let phone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let packet = RtpPacket {
            header: RtpHeader {
                payload_type: 8,
                marker: false,
                sequence: 1,
                timestamp: 160,
                ssrc: 7,
            },
            payload: bytes::Bytes::from_static(&[0x55; 160]),
        };
        phone.send_to(&packet.to_bytes(), &target).await.unwrap();
        wait_for("learning commit", || leg.remote().is_some()).await;
        assert_eq!(leg.remote().unwrap(), phone.local_addr().unwrap());

        intruder.send_to(&packet.to_bytes(), &target).await.unwrap();
        wait_for("rejection counter", || leg.rejected_packets() == 1).await;
        assert_eq!(leg.remote().unwrap(), phone.local_addr().unwrap());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn bridged_relay_is_bytewise() {
        let session = engine().create_session(8).await.unwrap();
        let caller_leg = session.caller_leg();
        let callee_leg = session.attach_callee(8).await.unwrap();
        session.bridge();

        let phone_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let phone_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let packet = RtpPacket {
            header: RtpHeader {
                payload_type: 8,
                marker: true,
                sequence: 99,
                timestamp: 4800,
                ssrc: 0x1234,
            },
            payload: bytes::Bytes::from_static(&[0xd5; 160]),
        };

        // Both sides commit learning first.
        phone_a
            .send_to(&packet.to_bytes(), format!("127.0.0.1:{}", caller_leg.rtp_port()))
            .await
            .unwrap();
        phone_b
            .send_to(&packet.to_bytes(), format!("127.0.0.1:{}", callee_leg.rtp_port()))
            .await
            .unwrap();
        wait_for("both legs committed", || {
            caller_leg.remote().is_some() && callee_leg.remote().is_some()
        })
        .await;

        // Now a caller-side packet must come out of the callee leg verbatim.
        let wire = packet.to_bytes();
        phone_a
            .send_to(&wire, format!("127.0.0.1:{}", caller_leg.rtp_port()))
            .await
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let received = loop {
            let (len, _) = phone_b.recv_from(&mut buf).await.unwrap();
            // Skip the learning packet echoed back by the first relay.
            let parsed = RtpPacket::parse(&buf[..len]).unwrap();
            if parsed.header.sequence == 99 && parsed.header.marker {
                break buf[..len].to_vec();
            }
        };
        assert_eq!(received.as_slice(), wire.as_ref());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn ports_return_to_pool_on_shutdown() {
        let media = engine();
        let before = media.pool().available();
        let session = media.create_session(0).await.unwrap();
        session.attach_callee(0).await.unwrap();
        assert_eq!(media.pool().available(), before - 2);

        session.shutdown().await;
        drop(session);
        wait_for("pool refill", || media.pool().available() == before).await;
    }

    #[tokio::test]
    async fn g711_cross_law_legs_are_bridgeable() {
        // PCMU <-> PCMA differ in payload type but both decode to PCM, so
        // the pair goes through the transcoding path.
        let session = engine().create_session(0).await.unwrap();
        assert!(session.attach_callee(8).await.is_ok());
        session.shutdown().await;
    }

    #[cfg(not(feature = "opus"))]
    #[tokio::test]
    async fn opus_bridge_refused_without_feature() {
        let session = engine().create_session(0).await.unwrap();
        assert!(matches!(
            session.attach_callee(111).await,
            Err(Error::UnsupportedPayload(111))
        ));
        session.shutdown().await;
    }
}
