//! N-way conference mixer
//!
//! Each room runs one frame-clocked loop on a 20 ms tick. Per tick it
//! drains one decoded frame per member, builds the audible sum over
//! non-muted members, and sends every member `sum − own` so nobody hears
//! themselves. Muted members are excluded from the audible sum but still
//! appear in the room recording.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::player::tone;
use crate::recorder::RecorderHandle;
use crate::rtp::{FRAME_DURATION, FRAME_SAMPLES};
use crate::session::{MediaSession, RtpStreamer};

/// Sample magnitude above which a member counts as talking this frame.
const TALK_THRESHOLD: i32 = 500;

/// Room behaviour knobs, resolved from the conference bridge entity.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_members: usize,
    pub announce_join: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        RoomConfig {
            max_members: 32,
            announce_join: true,
        }
    }
}

/// A member's public state, for diagnostics and the admin surface.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub id: Uuid,
    pub muted: bool,
    pub talking: bool,
}

enum RoomCmd {
    Join {
        member: MemberSeat,
    },
    Leave {
        id: Uuid,
    },
    SetMuted {
        id: Uuid,
        muted: bool,
    },
    StartRecording(RecorderHandle),
    StopRecording,
}

struct MemberSeat {
    id: Uuid,
    streamer: RtpStreamer,
    frames: mpsc::Receiver<(Uuid, Vec<i16>)>,
    muted: bool,
    talking: bool,
    current: Vec<i16>,
}

/// Handle held by the conference node for one joined caller.
pub struct Membership {
    room_id: u64,
    member_id: Uuid,
    rooms: Arc<ConferenceManager>,
    session: Arc<MediaSession>,
}

impl Membership {
    pub fn member_id(&self) -> Uuid {
        self.member_id
    }

    /// Leave the room and detach the session from the mixer.
    pub async fn leave(self) {
        self.session.unwire();
        self.rooms.send_cmd(self.room_id, RoomCmd::Leave { id: self.member_id });
    }

    pub fn set_muted(&self, muted: bool) {
        self.rooms.send_cmd(
            self.room_id,
            RoomCmd::SetMuted {
                id: self.member_id,
                muted,
            },
        );
    }
}

struct Room {
    cmd_tx: mpsc::Sender<RoomCmd>,
    members: Arc<AtomicUsize>,
    config: RoomConfig,
    snapshot: Arc<parking_lot::Mutex<Vec<MemberInfo>>>,
}

/// Owns every active conference room; rooms are created on first join and
/// torn down when the last member leaves.
pub struct ConferenceManager {
    rooms: DashMap<u64, Room>,
}

impl Default for ConferenceManager {
    fn default() -> Self {
        ConferenceManager::new()
    }
}

impl ConferenceManager {
    pub fn new() -> Self {
        ConferenceManager {
            rooms: DashMap::new(),
        }
    }

    /// Add a caller's media session to a room, creating the room if needed.
    ///
    /// The session's caller leg starts feeding the mixer and receiving the
    /// mixed output.
    pub fn join(
        self: &Arc<Self>,
        room_id: u64,
        config: RoomConfig,
        session: Arc<MediaSession>,
        muted: bool,
    ) -> Result<Membership> {
        let room = self.rooms.entry(room_id).or_insert_with(|| {
            info!(room_id, "conference room created");
            spawn_room(room_id, config.clone(), Arc::downgrade(self))
        });

        let current = room.members.load(Ordering::Acquire);
        if current >= room.config.max_members {
            return Err(Error::RoomFull {
                limit: room.config.max_members,
            });
        }
        room.members.fetch_add(1, Ordering::AcqRel);

        let member_id = Uuid::new_v4();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let streamer = session.streamer_for(session.caller_leg())?;
        session.join_mixer(member_id, frames_tx);

        let seat = MemberSeat {
            id: member_id,
            streamer,
            frames: frames_rx,
            muted,
            talking: false,
            current: vec![0i16; FRAME_SAMPLES],
        };
        let cmd_tx = room.cmd_tx.clone();
        drop(room);
        if cmd_tx.try_send(RoomCmd::Join { member: seat }).is_err() {
            warn!(room_id, "room loop gone during join");
            return Err(Error::SessionClosed);
        }

        Ok(Membership {
            room_id,
            member_id,
            rooms: self.clone(),
            session,
        })
    }

    /// Start recording the full room sum (all members, muted included).
    pub fn start_recording(&self, room_id: u64, handle: RecorderHandle) {
        self.send_cmd(room_id, RoomCmd::StartRecording(handle));
    }

    pub fn stop_recording(&self, room_id: u64) {
        self.send_cmd(room_id, RoomCmd::StopRecording);
    }

    /// Current member states, empty when the room does not exist.
    pub fn members(&self, room_id: u64) -> Vec<MemberInfo> {
        self.rooms
            .get(&room_id)
            .map(|room| room.snapshot.lock().clone())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: u64) -> usize {
        self.rooms
            .get(&room_id)
            .map(|room| room.members.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn send_cmd(&self, room_id: u64, cmd: RoomCmd) {
        if let Some(room) = self.rooms.get(&room_id) {
            let _ = room.cmd_tx.try_send(cmd);
        }
    }

    fn remove_room(&self, room_id: u64) {
        self.rooms.remove(&room_id);
        info!(room_id, "conference room destroyed");
    }
}

fn spawn_room(room_id: u64, config: RoomConfig, manager: std::sync::Weak<ConferenceManager>) -> Room {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let members = Arc::new(AtomicUsize::new(0));
    let snapshot = Arc::new(parking_lot::Mutex::new(Vec::new()));
    tokio::spawn(room_loop(
        room_id,
        config.clone(),
        cmd_rx,
        members.clone(),
        snapshot.clone(),
        manager,
    ));
    Room {
        cmd_tx,
        members,
        config,
        snapshot,
    }
}

async fn room_loop(
    room_id: u64,
    config: RoomConfig,
    mut cmd_rx: mpsc::Receiver<RoomCmd>,
    member_count: Arc<AtomicUsize>,
    snapshot: Arc<parking_lot::Mutex<Vec<MemberInfo>>>,
    manager: std::sync::Weak<ConferenceManager>,
) {
    let mut seats: Vec<MemberSeat> = Vec::new();
    let mut recorder: Option<RecorderHandle> = None;
    // Pending join announcement: remaining tone frames and who not to play
    // it to.
    let mut announce: Option<(Vec<Vec<i16>>, Uuid)> = None;
    let mut started = false;

    let mut tick = tokio::time::interval(FRAME_DURATION);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RoomCmd::Join { member }) => {
                        if config.announce_join && !seats.is_empty() {
                            let frames = tone(660.0, 200, 6_000)
                                .chunks(FRAME_SAMPLES)
                                .map(|c| c.to_vec())
                                .collect();
                            announce = Some((frames, member.id));
                        }
                        debug!(room_id, member = %member.id, "member joined");
                        seats.push(member);
                        started = true;
                    }
                    Some(RoomCmd::Leave { id }) => {
                        seats.retain(|seat| seat.id != id);
                        member_count.fetch_sub(1, Ordering::AcqRel);
                        debug!(room_id, member = %id, "member left");
                    }
                    Some(RoomCmd::SetMuted { id, muted }) => {
                        if let Some(seat) = seats.iter_mut().find(|s| s.id == id) {
                            seat.muted = muted;
                        }
                    }
                    Some(RoomCmd::StartRecording(handle)) => recorder = Some(handle),
                    Some(RoomCmd::StopRecording) => recorder = None,
                    None => break,
                }
                if started && seats.is_empty() {
                    break;
                }
            }
            _ = tick.tick() => {
                if seats.is_empty() {
                    continue;
                }
                mix_one_frame(&mut seats, recorder.as_ref(), &mut announce).await;
                *snapshot.lock() = seats
                    .iter()
                    .map(|seat| MemberInfo {
                        id: seat.id,
                        muted: seat.muted,
                        talking: seat.talking,
                    })
                    .collect();
            }
        }
    }

    if let Some(manager) = manager.upgrade() {
        manager.remove_room(room_id);
    }
}

/// Mix and distribute one 20 ms frame.
async fn mix_one_frame(
    seats: &mut [MemberSeat],
    recorder: Option<&RecorderHandle>,
    announce: &mut Option<(Vec<Vec<i16>>, Uuid)>,
) {
    // Pull the freshest frame per member; keep silence when none arrived.
    for seat in seats.iter_mut() {
        let mut latest = None;
        while let Ok((_, frame)) = seat.frames.try_recv() {
            latest = Some(frame);
        }
        match latest {
            Some(frame) => {
                seat.talking = frame.iter().any(|&s| (s as i32).abs() > TALK_THRESHOLD);
                seat.current = frame;
                seat.current.resize(FRAME_SAMPLES, 0);
            }
            None => {
                seat.talking = false;
                seat.current.iter_mut().for_each(|s| *s = 0);
            }
        }
    }

    // Audible sum excludes muted members; the recording sum includes them.
    let mut audible = [0i32; FRAME_SAMPLES];
    let mut full = [0i32; FRAME_SAMPLES];
    for seat in seats.iter() {
        for (i, &sample) in seat.current.iter().enumerate() {
            full[i] += sample as i32;
            if !seat.muted {
                audible[i] += sample as i32;
            }
        }
    }

    if let Some(recorder) = recorder {
        let frame: Vec<i16> = full
            .iter()
            .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect();
        recorder.push(frame);
    }

    let tone_frame = match announce {
        Some((frames, _)) if !frames.is_empty() => Some(frames.remove(0)),
        _ => None,
    };
    let announce_skip = announce.as_ref().map(|(_, skip)| *skip);
    if matches!(announce, Some((frames, _)) if frames.is_empty()) {
        *announce = None;
    }

    let mut out = [0i16; FRAME_SAMPLES];
    for seat in seats.iter_mut() {
        for i in 0..FRAME_SAMPLES {
            let own = if seat.muted { 0 } else { seat.current[i] as i32 };
            let mut sample = audible[i] - own;
            if let Some(tone_frame) = &tone_frame {
                if Some(seat.id) != announce_skip {
                    sample += tone_frame[i] as i32;
                }
            }
            out[i] = sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        if let Err(err) = seat.streamer.send_frame(&out).await {
            warn!(member = %seat.id, "mixer send failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seat(frames: mpsc::Receiver<(Uuid, Vec<i16>)>, streamer: RtpStreamer, muted: bool) -> MemberSeat {
        MemberSeat {
            id: Uuid::new_v4(),
            streamer,
            frames,
            muted,
            talking: false,
            current: vec![0i16; FRAME_SAMPLES],
        }
    }

    async fn test_session() -> (crate::session::MediaEngine, Arc<MediaSession>) {
        let engine = crate::session::MediaEngine::new(
            crate::ports::PortPool::new("127.0.0.1".parse().unwrap(), 43_000, 43_099),
            "127.0.0.1".parse().unwrap(),
        );
        let session = engine.create_session(8).await.unwrap();
        (engine, session)
    }

    #[tokio::test]
    async fn sum_minus_self_and_mute() {
        let (_engine, s1) = test_session().await;
        let (_e2, s2) = test_session().await;
        let (_e3, s3) = test_session().await;

        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let (tx_c, rx_c) = mpsc::channel(4);
        let mut seats = vec![
            seat(rx_a, s1.streamer_for(s1.caller_leg()).unwrap(), false),
            seat(rx_b, s2.streamer_for(s2.caller_leg()).unwrap(), false),
            seat(rx_c, s3.streamer_for(s3.caller_leg()).unwrap(), true),
        ];
        let ids: Vec<Uuid> = seats.iter().map(|s| s.id).collect();

        tx_a.send((ids[0], vec![100i16; FRAME_SAMPLES])).await.unwrap();
        tx_b.send((ids[1], vec![200i16; FRAME_SAMPLES])).await.unwrap();
        tx_c.send((ids[2], vec![400i16; FRAME_SAMPLES])).await.unwrap();

        let dir = std::env::temp_dir().join(format!("flowpbx-mix-{}", Uuid::new_v4()));
        let recorder = crate::recorder::Recorder::create(dir.join("room.wav")).await.unwrap();
        let handle = recorder.handle();

        let mut announce = None;
        mix_one_frame(&mut seats, Some(&handle), &mut announce).await;

        // A (100) hears audible(300) - own(100) = 200.
        // B (200) hears audible(300) - own(200) = 100.
        // C (muted, 400) hears audible(300) - 0 = 300; C is inaudible to others.
        // The recording carries the full sum including C: 700.
        let duration = recorder.finish().await.unwrap();
        assert_eq!(duration, 20);
        let recorded = crate::wav::decode(&std::fs::read(dir.join("room.wav")).unwrap()).unwrap();
        assert_eq!(recorded[0], 700);

        // Talking detection: nobody above threshold this frame.
        assert!(seats.iter().all(|s| !s.talking));

        std::fs::remove_dir_all(&dir).unwrap();
        s1.shutdown().await;
        s2.shutdown().await;
        s3.shutdown().await;
    }

    #[tokio::test]
    async fn room_capacity_enforced() {
        let manager = Arc::new(ConferenceManager::new());
        let engine = crate::session::MediaEngine::new(
            crate::ports::PortPool::new("127.0.0.1".parse().unwrap(), 43_100, 43_199),
            "127.0.0.1".parse().unwrap(),
        );
        let config = RoomConfig {
            max_members: 2,
            announce_join: false,
        };

        let s1 = engine.create_session(8).await.unwrap();
        let s2 = engine.create_session(8).await.unwrap();
        let s3 = engine.create_session(8).await.unwrap();

        let m1 = manager.join(42, config.clone(), s1.clone(), false).unwrap();
        let _m2 = manager.join(42, config.clone(), s2.clone(), false).unwrap();
        assert!(matches!(
            manager.join(42, config.clone(), s3.clone(), false),
            Err(Error::RoomFull { limit: 2 })
        ));
        assert_eq!(manager.member_count(42), 2);

        m1.leave().await;
        s1.shutdown().await;
        s2.shutdown().await;
        s3.shutdown().await;
    }
}
