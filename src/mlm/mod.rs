//! Management loop
//!
//! [`Mlme`] owns every piece of MAC management state and processes one
//! [`MlmEvent`] or timer expiry at a time on a single tokio task. Nothing
//! else touches the registry, the key installer or the sessions, so none of
//! them need locking.

pub mod device;

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::{
    post_key_cnf, restore_from_auth_state, AuthCnf, KeyOp, KeyRequestOrigin, MlmAuthReq,
    MlmConfirm, SmeSink,
};
use crate::error::{LimError, ResultCode};
use crate::keys::hal::HalResponse;
use crate::keys::install::{KeyInstaller, Ports};
use crate::keys::{RemoveKeyReq, SetKeysReq};
use crate::mac::{MacAddr, ReasonCode};
use crate::preauth::{AuthNodeState, PreAuthEntry, PreAuthRegistry, SweepHost};
use crate::session::{AuthType, MlmState, Session, SessionTable, SystemRole};
use crate::timer::{TimerId, TimerMode, Timers, TokioTimers};
use crate::wep::{self, TsfIvSource, WepKey};
use device::ChannelControlPlane;

/// 802.11 status codes used in authentication frames
pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_UNSPECIFIED_FAILURE: u16 = 1;
pub const STATUS_NOT_SUPPORTED_AUTH_ALG: u16 = 13;
pub const STATUS_AUTH_OUT_OF_SEQ: u16 = 14;
pub const STATUS_CHALLENGE_FAILURE: u16 = 15;

/// Default key used to protect frame 3
const DEFAULT_KEY_ID: u8 = 0;
const EVENT_QUEUE_DEPTH: usize = 64;
const TIMER_QUEUE_DEPTH: usize = 16;

/// Authentication frame fields this layer reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFrame {
    pub algo: AuthType,
    pub seq: u16,
    pub status: u16,
    /// Challenge text in frame 2, WEP-protected body in frame 3, else empty
    pub body: Vec<u8>,
}

impl AuthFrame {
    pub fn new(algo: AuthType, seq: u16, status: u16, body: Vec<u8>) -> Self {
        Self {
            algo,
            seq,
            status,
            body,
        }
    }
}

/// Frames handed to the transmit path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Auth { peer: MacAddr, frame: AuthFrame },
    Deauth { peer: MacAddr, reason: ReasonCode },
}

/// Which key interface a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// BSS-wide (group) keys
    Group,
    /// Keys of one peer, addressed by its station index
    Peer { sta_idx: u16, def_wep_idx: u8 },
}

/// Inputs to the management loop
#[derive(Debug)]
pub enum MlmEvent {
    SetKeys { req: SetKeysReq, scope: KeyScope },
    RemoveKey { req: RemoveKeyReq, scope: KeyScope },
    /// Authentication frame received from `peer`
    AuthFrame { peer: MacAddr, frame: AuthFrame },
    /// `peer` completed association with this AP
    Associated { peer: MacAddr, aid: u16 },
    /// SME asks this STA to authenticate with a peer
    Authenticate(MlmAuthReq),
    /// Control-plane device reply
    HalRsp(HalResponse),
    Teardown,
}

/// Caller's side of a running [`Mlme`]
pub struct MlmeIo {
    pub events: mpsc::Sender<MlmEvent>,
    pub confirms: mpsc::UnboundedReceiver<MlmConfirm>,
    pub frames: mpsc::UnboundedReceiver<OutFrame>,
}

impl SmeSink for mpsc::UnboundedSender<MlmConfirm> {
    fn post(&mut self, cnf: MlmConfirm) {
        if self.send(cnf).is_err() {
            warn!("SME receiver dropped, confirmation lost");
        }
    }
}

/// Associated peers and the transmit path
#[derive(Debug)]
pub struct StationTable {
    associated: HashMap<MacAddr, u16>,
    frames: mpsc::UnboundedSender<OutFrame>,
}

impl StationTable {
    fn new(frames: mpsc::UnboundedSender<OutFrame>) -> Self {
        Self {
            associated: HashMap::new(),
            frames,
        }
    }

    pub fn associate(&mut self, peer: MacAddr, aid: u16) {
        self.associated.insert(peer, aid);
    }

    pub fn aid_of(&self, peer: &MacAddr) -> Option<u16> {
        self.associated.get(peer).copied()
    }

    fn send_auth(&self, peer: MacAddr, frame: AuthFrame) {
        debug!(
            "Sending auth frame {} ({:?}, status {}) to {}",
            frame.seq, frame.algo, frame.status, peer
        );
        self.transmit(OutFrame::Auth { peer, frame });
    }

    fn transmit(&self, frame: OutFrame) {
        if self.frames.send(frame).is_err() {
            warn!("Transmit path closed, frame dropped");
        }
    }
}

impl SweepHost for StationTable {
    fn is_associated(&self, peer: &MacAddr) -> bool {
        self.associated.contains_key(peer)
    }

    fn send_deauth(&mut self, peer: &MacAddr, reason: ReasonCode) {
        info!("Sending deauth to {} (reason {})", peer, reason.as_u16());
        self.transmit(OutFrame::Deauth {
            peer: *peer,
            reason,
        });
    }
}

/// MAC layer management entity for one session
pub struct Mlme {
    config: Config,
    sessions: SessionTable,
    registry: PreAuthRegistry,
    installer: KeyInstaller,
    stations: StationTable,
    timers: TokioTimers,
    hal: ChannelControlPlane,
    sme: mpsc::UnboundedSender<MlmConfirm>,
    ivs: TsfIvSource,
    wep_key: Option<WepKey>,
    next_node_idx: u16,
    pending_auth: Option<MlmAuthReq>,
    events: mpsc::Receiver<MlmEvent>,
    timer_rx: mpsc::Receiver<TimerId>,
    started: bool,
}

impl Mlme {
    pub fn new(config: Config, wep_key: Option<WepKey>, hal: ChannelControlPlane) -> (Self, MlmeIo) {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_QUEUE_DEPTH);
        let (sme, confirms) = mpsc::unbounded_channel();
        let (frames_tx, frames) = mpsc::unbounded_channel();

        let mlm = &config.mlm;
        let mut session = Session::new(mlm.session_id, mlm.bss_idx, mlm.bssid, mlm.role);
        session.auth_type = mlm.auth_type;
        session.privacy = mlm.privacy;
        let mut sessions = SessionTable::new();
        sessions.insert(session);

        let me = Self {
            registry: PreAuthRegistry::new(mlm.role),
            installer: KeyInstaller::new(mlm.max_pending_requests),
            sessions,
            stations: StationTable::new(frames_tx),
            timers: TokioTimers::new(timer_tx),
            hal,
            sme,
            ivs: TsfIvSource::new(),
            wep_key,
            next_node_idx: 1,
            pending_auth: None,
            events,
            timer_rx,
            started: false,
            config,
        };
        let io = MlmeIo {
            events: events_tx,
            confirms,
            frames,
        };
        (me, io)
    }

    /// Initialise the registry (and its sweep timer). Must run inside a
    /// tokio runtime; [`Mlme::run`] calls it on entry.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        let role = self.config.mlm.role;
        self.registry.init(role, &self.config, &mut self.timers);
        self.started = true;
        info!(
            "MLM started: {:?} session {} on {}",
            role, self.config.mlm.session_id, self.config.mlm.bssid
        );
    }

    /// Process events until teardown or until every sender is gone
    pub async fn run(mut self) {
        self.start();
        loop {
            tokio::select! {
                ev = self.events.recv() => match ev {
                    Some(ev) => {
                        if !self.handle_event(ev) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(id) = self.timer_rx.recv() => self.handle_timer(id),
            }
        }
        self.shutdown();
    }

    /// Handle one event; returns `false` once the loop should stop
    pub fn handle_event(&mut self, ev: MlmEvent) -> bool {
        match ev {
            MlmEvent::SetKeys { req, scope } => self.on_set_keys(req, scope),
            MlmEvent::RemoveKey { req, scope } => self.on_remove_key(req, scope),
            MlmEvent::AuthFrame { peer, frame } => match self.config.mlm.role {
                SystemRole::Ap => self.on_ap_auth_frame(peer, frame),
                SystemRole::Sta => self.on_sta_auth_frame(peer, frame),
                SystemRole::Ibss => debug!("Auth frame from {} ignored in IBSS", peer),
            },
            MlmEvent::Associated { peer, aid } => self.on_associated(peer, aid),
            MlmEvent::Authenticate(req) => self.on_authenticate(req),
            MlmEvent::HalRsp(rsp) => {
                self.installer
                    .complete(rsp, &mut self.sessions, &mut self.sme);
            }
            MlmEvent::Teardown => {
                info!("Teardown requested");
                return false;
            }
        }
        true
    }

    pub fn handle_timer(&mut self, id: TimerId) {
        match id {
            TimerId::PreAuthCleanup => {
                self.registry.sweep(&mut self.timers, &mut self.stations);
            }
            TimerId::AuthResponse(idx) => {
                // an expiry can still be queued after frame 3 completed
                let Some(peer) = self
                    .registry
                    .search_by_node_idx(idx)
                    .filter(|e| e.timer_started && e.state == AuthNodeState::WaitFrame3)
                    .map(|e| e.peer_mac)
                else {
                    debug!("Stale auth response timeout for node {}", idx);
                    return;
                };
                warn!("No auth frame 3 from {} in time", peer);
                self.registry.delete(&peer, &mut self.timers);
            }
            TimerId::AuthFailure => {
                if self.pending_auth.is_some() {
                    warn!("Authentication attempt timed out");
                    self.finish_auth(ResultCode::Timeout, STATUS_UNSPECIFIED_FAILURE);
                }
            }
        }
    }

    pub fn registry(&self) -> &PreAuthRegistry {
        &self.registry
    }

    pub fn installer(&self) -> &KeyInstaller {
        &self.installer
    }

    pub fn stations(&self) -> &StationTable {
        &self.stations
    }

    pub fn session(&self) -> Option<&Session> {
        self.sessions.get(self.config.mlm.session_id)
    }

    fn shutdown(&mut self) {
        let released = self.registry.delete_all(&mut self.timers);
        self.timers.deactivate(TimerId::PreAuthCleanup);
        if self.installer.pending() > 0 {
            warn!(
                "Stopping with {} key requests unanswered",
                self.installer.pending()
            );
        }
        info!("MLM stopped ({} pre-auth entries released)", released);
    }

    fn on_set_keys(&mut self, req: SetKeysReq, scope: KeyScope) {
        let Some(session) = self.sessions.get_mut(req.session_id) else {
            self.reject_unknown_session(KeyOp::SetKeys, req.peer_mac, req.session_id, req.aid);
            return;
        };
        let ports = Ports {
            cfg: &self.config,
            hal: &mut self.hal,
            sme: &mut self.sme,
        };
        let res = match scope {
            KeyScope::Group => self.installer.set_group_key(req, session, ports),
            KeyScope::Peer {
                sta_idx,
                def_wep_idx,
            } => self
                .installer
                .set_peer_key(req, sta_idx, def_wep_idx, session, ports),
        };
        if let Ok(token) = res {
            debug!("SetKeys pending as token {}", token);
        }
    }

    fn on_remove_key(&mut self, req: RemoveKeyReq, scope: KeyScope) {
        let Some(session) = self.sessions.get_mut(req.session_id) else {
            self.reject_unknown_session(KeyOp::RemoveKey, req.peer_mac, req.session_id, 0);
            return;
        };
        let ports = Ports {
            cfg: &self.config,
            hal: &mut self.hal,
            sme: &mut self.sme,
        };
        let res = match scope {
            KeyScope::Group => self.installer.remove_group_key(req, session, ports),
            KeyScope::Peer { sta_idx, .. } => {
                self.installer.remove_peer_key(req, sta_idx, session, ports)
            }
        };
        if let Ok(token) = res {
            debug!("RemoveKey pending as token {}", token);
        }
    }

    fn reject_unknown_session(&mut self, op: KeyOp, peer_mac: MacAddr, session_id: u8, aid: u16) {
        warn!("{:?} for {} names unknown session {}", op, peer_mac, session_id);
        let origin = KeyRequestOrigin {
            op,
            peer_mac,
            session_id,
            aid,
            state_saved: false,
        };
        post_key_cnf(&mut self.sme, None, origin, ResultCode::InvalidParameters);
    }

    fn on_ap_auth_frame(&mut self, peer: MacAddr, frame: AuthFrame) {
        match frame.seq {
            1 => self.on_auth_frame1(peer, frame.algo),
            3 => self.on_auth_frame3(peer, frame),
            seq => warn!("Unexpected auth frame {} from {}", seq, peer),
        }
    }

    fn on_auth_frame1(&mut self, peer: MacAddr, algo: AuthType) {
        let Some(session) = self.sessions.get(self.config.mlm.session_id) else {
            error!("No session for auth frame from {}", peer);
            return;
        };
        let bssid = session.bssid;
        let supported = match algo {
            AuthType::Open => session.is_auth_algo_supported(algo, &self.config),
            AuthType::Shared => {
                self.wep_key.is_some() && session.is_auth_algo_supported(algo, &self.config)
            }
            AuthType::AutoSwitch => false,
        };
        if !supported {
            warn!("{:?} authentication from {} not supported", algo, peer);
            self.stations.send_auth(
                peer,
                AuthFrame::new(algo, 2, STATUS_NOT_SUPPORTED_AUTH_ALG, Vec::new()),
            );
            return;
        }

        // a peer restarting authentication loses its old context
        if self.registry.search(&peer).is_some() {
            debug!("{} restarted authentication", peer);
            self.registry.delete(&peer, &mut self.timers);
        }

        if algo == AuthType::Open {
            if let Err(e) = self.registry.add(PreAuthEntry::new(peer, AuthType::Open)) {
                error!("Could not track {}: {}", peer, e);
                return;
            }
            self.stations
                .send_auth(peer, AuthFrame::new(algo, 2, STATUS_SUCCESS, Vec::new()));
            return;
        }

        let challenge = wep::challenge_text(&mut self.ivs, &bssid.octets());
        let Some(idx) = self.alloc_node_idx() else {
            error!("No free node index to track {}", peer);
            return;
        };
        let entry = PreAuthEntry::new(peer, AuthType::Shared)
            .with_node_idx(idx)
            .with_challenge(challenge.clone());
        if let Err(e) = self.registry.add(entry) {
            error!("Could not track {}: {}", peer, e);
            return;
        }

        let timeout = Duration::from_millis(self.config.mlm.auth_rsp_timeout_ms);
        if let Err(e) = self
            .registry
            .arm_response_timer(&peer, &mut self.timers, timeout)
        {
            error!("Could not arm auth response timer for {}: {}", peer, e);
            self.registry.delete(&peer, &mut self.timers);
            self.stations.send_auth(
                peer,
                AuthFrame::new(algo, 2, STATUS_UNSPECIFIED_FAILURE, Vec::new()),
            );
            return;
        }

        self.stations
            .send_auth(peer, AuthFrame::new(algo, 2, STATUS_SUCCESS, challenge));
    }

    fn on_auth_frame3(&mut self, peer: MacAddr, frame: AuthFrame) {
        let expected = match self.registry.search(&peer) {
            Some(entry) if entry.state == AuthNodeState::WaitFrame3 => {
                entry.challenge.clone().unwrap_or_default()
            }
            _ => {
                warn!("Auth frame 3 from {} out of sequence", peer);
                self.stations.send_auth(
                    peer,
                    AuthFrame::new(frame.algo, 4, STATUS_AUTH_OUT_OF_SEQ, Vec::new()),
                );
                return;
            }
        };

        let verdict = match &self.wep_key {
            Some(key) => wep::decrypt_auth_body(key, &frame.body),
            None => Err(LimError::invalid("no WEP key for shared key authentication")),
        };
        let status = match verdict {
            Ok(plain) if plain == expected => {
                match self.registry.mark_authenticated(&peer, &mut self.timers) {
                    Ok(()) => {
                        info!("{} passed shared key authentication", peer);
                        STATUS_SUCCESS
                    }
                    Err(e) => {
                        error!("{}", e);
                        STATUS_UNSPECIFIED_FAILURE
                    }
                }
            }
            Ok(_) => {
                warn!("Challenge text from {} does not match", peer);
                STATUS_CHALLENGE_FAILURE
            }
            Err(e) => {
                warn!("Could not decrypt auth frame 3 from {}: {}", peer, e);
                STATUS_CHALLENGE_FAILURE
            }
        };

        if status != STATUS_SUCCESS {
            self.registry.delete(&peer, &mut self.timers);
        }
        self.stations
            .send_auth(peer, AuthFrame::new(AuthType::Shared, 4, status, Vec::new()));
    }

    fn on_associated(&mut self, peer: MacAddr, aid: u16) {
        info!("{} associated with aid {}", peer, aid);
        self.stations.associate(peer, aid);
        if self.registry.search(&peer).is_some() {
            self.registry.delete(&peer, &mut self.timers);
        }
    }

    fn on_authenticate(&mut self, req: MlmAuthReq) {
        let session_id = self.config.mlm.session_id;
        let Some(session) = self.sessions.get_mut(session_id) else {
            error!("No session {} to authenticate on", session_id);
            return;
        };

        if session.role != SystemRole::Sta || self.pending_auth.is_some() {
            warn!(
                "Authentication with {} refused in {:?} / {}",
                req.peer_mac, session.role, session.mlm_state
            );
            post_auth_cnf(&mut self.sme, &req, session_id, ResultCode::InvalidParameters);
            return;
        }
        if !session.is_auth_algo_supported(req.auth_type, &self.config) {
            warn!("{:?} authentication is disabled", req.auth_type);
            post_auth_cnf(&mut self.sme, &req, session_id, ResultCode::InvalidParameters);
            return;
        }

        session.enter_wait_state(MlmState::WtAuthFrame2);
        let timeout = Duration::from_millis(self.config.mlm.auth_failure_timeout_ms);
        if let Err(e) = self
            .timers
            .activate(TimerId::AuthFailure, timeout, TimerMode::OneShot)
        {
            error!("Could not arm auth failure timer: {}", e);
            restore_from_auth_state(
                ResultCode::from(&e),
                STATUS_UNSPECIFIED_FAILURE,
                session,
                req,
                &mut self.timers,
                &mut self.sme,
            );
            return;
        }

        let algo = match req.auth_type {
            AuthType::Shared => AuthType::Shared,
            AuthType::Open | AuthType::AutoSwitch => AuthType::Open,
        };
        self.stations
            .send_auth(req.peer_mac, AuthFrame::new(algo, 1, STATUS_SUCCESS, Vec::new()));
        self.pending_auth = Some(req);
    }

    fn on_sta_auth_frame(&mut self, peer: MacAddr, frame: AuthFrame) {
        match &self.pending_auth {
            Some(req) if req.peer_mac == peer => {}
            _ => {
                debug!("Auth frame from {} with no attempt in progress", peer);
                return;
            }
        }

        match frame.seq {
            2 if frame.algo == AuthType::Shared && frame.status == STATUS_SUCCESS => {
                let sealed = match &self.wep_key {
                    Some(key) => {
                        wep::encrypt_auth_body(key, DEFAULT_KEY_ID, &frame.body, &mut self.ivs)
                    }
                    None => Err(LimError::invalid("no WEP key for shared key authentication")),
                };
                match sealed {
                    Ok(body) => self
                        .stations
                        .send_auth(peer, AuthFrame::new(AuthType::Shared, 3, STATUS_SUCCESS, body)),
                    Err(e) => {
                        error!("Could not answer challenge from {}: {}", peer, e);
                        self.finish_auth(ResultCode::from(&e), STATUS_UNSPECIFIED_FAILURE);
                    }
                }
            }
            2 | 4 => {
                let result = if frame.status == STATUS_SUCCESS {
                    ResultCode::Success
                } else {
                    ResultCode::AuthRefused {
                        status: frame.status,
                    }
                };
                self.finish_auth(result, frame.status);
            }
            seq => warn!("Unexpected auth frame {} from {}", seq, peer),
        }
    }

    fn finish_auth(&mut self, result: ResultCode, prot_status: u16) {
        let Some(req) = self.pending_auth.take() else {
            return;
        };
        match self.sessions.get_mut(self.config.mlm.session_id) {
            Some(session) => restore_from_auth_state(
                result,
                prot_status,
                session,
                req,
                &mut self.timers,
                &mut self.sme,
            ),
            None => error!("Session gone before authentication with {} finished", req.peer_mac),
        }
    }

    /// Next free nonzero node index, if any is left
    fn alloc_node_idx(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let idx = self.next_node_idx;
            self.next_node_idx = self.next_node_idx.wrapping_add(1).max(1);
            if self.registry.search_by_node_idx(idx).is_none() {
                return Some(idx);
            }
        }
        None
    }
}

fn post_auth_cnf(sme: &mut dyn SmeSink, req: &MlmAuthReq, session_id: u8, result_code: ResultCode) {
    sme.post(MlmConfirm::Auth(AuthCnf {
        peer_mac: req.peer_mac,
        auth_type: req.auth_type,
        result_code,
        prot_status: STATUS_UNSPECIFIED_FAILURE,
        session_id,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::hal::CtrlMsg;
    use crate::keys::KeyMaterial;

    const PEER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
    const KEY: [u8; 5] = [0x01, 0x02, 0x03, 0x04, 0x05];

    fn setup(role: SystemRole) -> (Mlme, MlmeIo, mpsc::Receiver<CtrlMsg>) {
        let mut config = Config::default();
        config.mlm.role = role;
        let (hal, hal_rx) = ChannelControlPlane::new(4);
        let key = WepKey::new(&KEY).unwrap();
        let (mut mlme, io) = Mlme::new(config, Some(key), hal);
        mlme.start();
        (mlme, io, hal_rx)
    }

    fn auth_frame(algo: AuthType, seq: u16, body: Vec<u8>) -> MlmEvent {
        MlmEvent::AuthFrame {
            peer: PEER,
            frame: AuthFrame::new(algo, seq, STATUS_SUCCESS, body),
        }
    }

    fn next_auth(io: &mut MlmeIo) -> AuthFrame {
        match io.frames.try_recv() {
            Ok(OutFrame::Auth { peer, frame }) => {
                assert_eq!(peer, PEER);
                frame
            }
            other => panic!("Expected auth frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_auth_adds_authenticated_entry() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Open, 1, vec![]));

        let rsp = next_auth(&mut io);
        assert_eq!((rsp.seq, rsp.status), (2, STATUS_SUCCESS));
        let entry = mlme.registry().search(&PEER).unwrap();
        assert_eq!(entry.state, AuthNodeState::Authenticated);
        assert!(mlme.registry().sweep_enabled());
    }

    #[tokio::test]
    async fn test_shared_key_exchange_on_ap() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Shared, 1, vec![]));

        let frame2 = next_auth(&mut io);
        assert_eq!(frame2.body.len(), wep::CHALLENGE_TEXT_LEN);
        let entry = mlme.registry().search(&PEER).unwrap();
        assert_eq!(entry.state, AuthNodeState::WaitFrame3);
        let idx = entry.auth_node_idx.unwrap();
        assert!(mlme.timers.is_active(TimerId::AuthResponse(idx)));

        let key = WepKey::new(&KEY).unwrap();
        let body = wep::encrypt_with_iv(&key, 0, &frame2.body, [7, 8, 9]).unwrap();
        mlme.handle_event(auth_frame(AuthType::Shared, 3, body));

        let frame4 = next_auth(&mut io);
        assert_eq!((frame4.seq, frame4.status), (4, STATUS_SUCCESS));
        let entry = mlme.registry().search(&PEER).unwrap();
        assert_eq!(entry.state, AuthNodeState::Authenticated);
        assert!(!mlme.timers.is_active(TimerId::AuthResponse(idx)));

        // expiry already queued before the cancel must not evict the peer
        mlme.handle_timer(TimerId::AuthResponse(idx));
        assert!(mlme.registry().search(&PEER).is_some());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_challenge() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Shared, 1, vec![]));
        let frame2 = next_auth(&mut io);

        let other = WepKey::new(&[9, 9, 9, 9, 9]).unwrap();
        let body = wep::encrypt_with_iv(&other, 0, &frame2.body, [1, 2, 3]).unwrap();
        mlme.handle_event(auth_frame(AuthType::Shared, 3, body));

        let frame4 = next_auth(&mut io);
        assert_eq!(frame4.status, STATUS_CHALLENGE_FAILURE);
        assert!(mlme.registry().search(&PEER).is_none());
    }

    #[tokio::test]
    async fn test_frame3_without_frame1_is_out_of_sequence() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Shared, 3, vec![0; 12]));
        assert_eq!(next_auth(&mut io).status, STATUS_AUTH_OUT_OF_SEQ);
    }

    #[tokio::test]
    async fn test_disabled_algorithm_is_refused() {
        let mut config = Config::default();
        config.mlm.auth_type = AuthType::Open;
        let (hal, _hal_rx) = ChannelControlPlane::new(4);
        let (mut mlme, mut io) = Mlme::new(config, None, hal);
        mlme.start();

        mlme.handle_event(auth_frame(AuthType::Shared, 1, vec![]));
        assert_eq!(next_auth(&mut io).status, STATUS_NOT_SUPPORTED_AUTH_ALG);
        assert!(mlme.registry().is_empty());
    }

    #[tokio::test]
    async fn test_response_timeout_drops_entry() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Shared, 1, vec![]));
        next_auth(&mut io);
        let idx = mlme.registry().search(&PEER).unwrap().auth_node_idx.unwrap();

        mlme.handle_timer(TimerId::AuthResponse(idx));
        assert!(mlme.registry().search(&PEER).is_none());
    }

    #[tokio::test]
    async fn test_association_clears_preauth_entry() {
        let (mut mlme, _io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Open, 1, vec![]));
        mlme.handle_event(MlmEvent::Associated { peer: PEER, aid: 3 });

        assert!(mlme.registry().search(&PEER).is_none());
        assert_eq!(mlme.stations().aid_of(&PEER), Some(3));
    }

    #[tokio::test]
    async fn test_sweep_deauths_unassociated_peer() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Ap);
        mlme.handle_event(auth_frame(AuthType::Open, 1, vec![]));
        next_auth(&mut io);

        mlme.handle_timer(TimerId::PreAuthCleanup);
        mlme.handle_timer(TimerId::PreAuthCleanup);

        assert!(mlme.registry().is_empty());
        assert_eq!(
            io.frames.try_recv().unwrap(),
            OutFrame::Deauth {
                peer: PEER,
                reason: ReasonCode::PrevAuthNotValid
            }
        );
    }

    #[tokio::test]
    async fn test_sta_auth_timeout_confirms_once() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Sta);
        mlme.handle_event(MlmEvent::Authenticate(MlmAuthReq {
            peer_mac: PEER,
            auth_type: AuthType::Open,
        }));
        assert_eq!(next_auth(&mut io).seq, 1);
        assert_eq!(mlme.session().unwrap().mlm_state, MlmState::WtAuthFrame2);

        mlme.handle_timer(TimerId::AuthFailure);
        mlme.handle_timer(TimerId::AuthFailure);

        assert_eq!(mlme.session().unwrap().mlm_state, MlmState::Idle);
        assert_eq!(io.confirms.try_recv().unwrap().result_code(), ResultCode::Timeout);
        assert!(io.confirms.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sta_refused_by_peer() {
        let (mut mlme, mut io, _hal) = setup(SystemRole::Sta);
        mlme.handle_event(MlmEvent::Authenticate(MlmAuthReq {
            peer_mac: PEER,
            auth_type: AuthType::Open,
        }));
        next_auth(&mut io);

        mlme.handle_event(MlmEvent::AuthFrame {
            peer: PEER,
            frame: AuthFrame::new(AuthType::Open, 2, STATUS_NOT_SUPPORTED_AUTH_ALG, vec![]),
        });
        match io.confirms.try_recv().unwrap() {
            MlmConfirm::Auth(cnf) => {
                assert_eq!(cnf.result_code, ResultCode::AuthRefused { status: 13 });
                assert_eq!(cnf.prot_status, 13);
            }
            other => panic!("Expected Auth confirmation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_key_request_for_unknown_session() {
        let (mut mlme, mut io, mut hal) = setup(SystemRole::Ap);
        mlme.handle_event(MlmEvent::SetKeys {
            req: SetKeysReq {
                peer_mac: PEER,
                aid: 1,
                session_id: 9,
                material: KeyMaterial::wep(0, false, &KEY).unwrap(),
            },
            scope: KeyScope::Group,
        });

        assert_eq!(
            io.confirms.try_recv().unwrap().result_code(),
            ResultCode::InvalidParameters
        );
        assert!(hal.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_key_request_reaches_device_and_completes() {
        let (mut mlme, mut io, mut hal) = setup(SystemRole::Ap);
        mlme.handle_event(MlmEvent::SetKeys {
            req: SetKeysReq {
                peer_mac: PEER,
                aid: 1,
                session_id: 0,
                material: KeyMaterial::wep(0, false, &KEY).unwrap(),
            },
            scope: KeyScope::Peer {
                sta_idx: 2,
                def_wep_idx: 0,
            },
        });
        assert_eq!(mlme.session().unwrap().mlm_state, MlmState::WtSetStaKey);

        let msg = hal.try_recv().unwrap();
        mlme.handle_event(MlmEvent::HalRsp(HalResponse::success(msg.dialog_token)));

        assert_eq!(mlme.session().unwrap().mlm_state, MlmState::BssStarted);
        assert_eq!(io.confirms.try_recv().unwrap().result_code(), ResultCode::Success);
        assert_eq!(mlme.installer().pending(), 0);
    }

    #[tokio::test]
    async fn test_back_to_back_key_requests_resume_bss_state() {
        let (mut mlme, mut io, mut hal) = setup(SystemRole::Ap);
        let req = |unicast| SetKeysReq {
            peer_mac: PEER,
            aid: 1,
            session_id: 0,
            material: KeyMaterial::wep(0, unicast, &KEY).unwrap(),
        };
        mlme.handle_event(MlmEvent::SetKeys {
            req: req(true),
            scope: KeyScope::Peer {
                sta_idx: 1,
                def_wep_idx: 0,
            },
        });
        mlme.handle_event(MlmEvent::SetKeys {
            req: req(false),
            scope: KeyScope::Group,
        });
        assert_eq!(mlme.installer().pending(), 2);

        for _ in 0..2 {
            let msg = hal.try_recv().unwrap();
            mlme.handle_event(MlmEvent::HalRsp(HalResponse::success(msg.dialog_token)));
            assert_eq!(io.confirms.try_recv().unwrap().result_code(), ResultCode::Success);
        }
        assert_eq!(mlme.session().unwrap().mlm_state, MlmState::BssStarted);
    }
}
