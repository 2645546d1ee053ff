//! Key install protocol
//!
//! Each request is validated, packaged into a control-plane message and
//! posted. From there it completes one of two ways:
//!
//! - synchronously, when validation, resource reservation or the post itself
//!   fails: a confirmation is delivered before the call returns `Err`
//! - asynchronously, when the post is accepted: the call returns the dialog
//!   token and [`KeyInstaller::complete`] confirms once the device replies

use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use super::hal::{
    ControlPlane, CtrlMsg, CtrlMsgBody, HalResponse, RemoveBssKeyParams, RemoveStaKeyParams,
    SetBssKeyParams, SetStaKeyParams, StaKeyMaterial,
};
use super::{EdType, RemoveKeyReq, SetKeysReq, WepType, MAX_NUM_DEFAULT_KEYS};
use crate::config::{CfgItem, CfgSource};
use crate::dispatch::{post_key_cnf, KeyOp, KeyRequestOrigin, SmeSink};
use crate::error::{LimError, Result, ResultCode};
use crate::mac::MacAddr;
use crate::session::{MlmState, Session, SessionTable, SystemRole};

/// Collaborators a key request talks to
pub struct Ports<'a> {
    pub cfg: &'a dyn CfgSource,
    pub hal: &'a mut dyn ControlPlane,
    pub sme: &'a mut dyn SmeSink,
}

/// Issues key requests and tracks the ones awaiting a device reply
#[derive(Debug)]
pub struct KeyInstaller {
    next_token: u16,
    pending: HashMap<u16, KeyRequestOrigin>,
    max_pending: usize,
}

impl KeyInstaller {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_token: 1,
            pending: HashMap::new(),
            max_pending,
        }
    }

    /// Requests posted to the device and not yet answered
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Install group keys for the session's BSS
    pub fn set_group_key(
        &mut self,
        req: SetKeysReq,
        session: &mut Session,
        ports: Ports<'_>,
    ) -> Result<u16> {
        let origin = origin(KeyOp::SetKeys, &req.peer_mac, req.aid, session);

        if req.material.num_keys() > MAX_NUM_DEFAULT_KEYS {
            let err = LimError::invalid(format!(
                "numKeys = {} is more than {}",
                req.material.num_keys(),
                MAX_NUM_DEFAULT_KEYS
            ));
            return Err(fail(ports.sme, session, origin, err));
        }
        if let Err(err) = self.reserve() {
            return Err(fail(ports.sme, session, origin, err));
        }

        let body = CtrlMsgBody::SetBssKey(SetBssKeyParams {
            bss_idx: session.bss_idx,
            enc_type: req.material.ed_type,
            keys: req.material.keys,
            single_tid_rc: read_single_tid_rc(ports.cfg),
            session_id: session.session_id,
        });

        self.post(body, MlmState::WtSetBssKey, origin, session, ports)
    }

    /// Install the unicast (or, for an IBSS peer, broadcast) key of one peer.
    ///
    /// WEP with no keys supplied selects static mode: the device takes the
    /// default keys from its own configuration. Any supplied key is sent
    /// as the dynamic key.
    pub fn set_peer_key(
        &mut self,
        req: SetKeysReq,
        sta_idx: u16,
        def_wep_idx: u8,
        session: &mut Session,
        ports: Ports<'_>,
    ) -> Result<u16> {
        let origin = origin(KeyOp::SetKeys, &req.peer_mac, req.aid, session);
        let material = &req.material;

        if material.num_keys() > MAX_NUM_DEFAULT_KEYS {
            let err = LimError::invalid(format!(
                "numKeys = {} is more than {}",
                material.num_keys(),
                MAX_NUM_DEFAULT_KEYS
            ));
            return Err(fail(ports.sme, session, origin, err));
        }
        if def_wep_idx as usize >= MAX_NUM_DEFAULT_KEYS {
            let err = LimError::invalid(format!("default WEP index {} out of range", def_wep_idx));
            return Err(fail(ports.sme, session, origin, err));
        }

        let sta_material = match (material.ed_type, material.keys.first()) {
            (EdType::Wep40 | EdType::Wep104, None) => StaKeyMaterial::Static,
            (EdType::None, _) => StaKeyMaterial::Clear,
            (_, Some(key)) => StaKeyMaterial::Dynamic(key.clone()),
            (ed_type, None) => {
                let err = LimError::invalid(format!("{} peer key install without a key", ed_type));
                return Err(fail(ports.sme, session, origin, err));
            }
        };

        if let Err(err) = self.reserve() {
            return Err(fail(ports.sme, session, origin, err));
        }

        let bcast = session.role == SystemRole::Ibss
            && material.keys.first().map(|k| !k.unicast).unwrap_or(false);

        let params = SetStaKeyParams {
            sta_idx,
            enc_type: material.ed_type,
            material: sta_material,
            def_wep_idx,
            single_tid_rc: read_single_tid_rc(ports.cfg),
            session_id: session.session_id,
        };

        let (body, wait) = if bcast {
            (CtrlMsgBody::SetStaBcastKey(params), MlmState::WtSetStaBcastKey)
        } else {
            (CtrlMsgBody::SetStaKey(params), MlmState::WtSetStaKey)
        };
        self.post(body, wait, origin, session, ports)
    }

    /// Remove a group key from the session's BSS
    pub fn remove_group_key(
        &mut self,
        req: RemoveKeyReq,
        session: &mut Session,
        ports: Ports<'_>,
    ) -> Result<u16> {
        let origin = origin(KeyOp::RemoveKey, &req.peer_mac, 0, session);

        if let Err(err) = check_key_id(req.key_id).and_then(|_| self.reserve()) {
            return Err(fail(ports.sme, session, origin, err));
        }

        let body = CtrlMsgBody::RemoveBssKey(RemoveBssKeyParams {
            bss_idx: session.bss_idx,
            enc_type: req.ed_type,
            key_id: req.key_id,
            wep_type: req.wep_type,
            session_id: session.session_id,
        });

        self.post(body, MlmState::WtRemoveBssKey, origin, session, ports)
    }

    /// Remove a peer key. Static WEP keys belong to the BSS and must be
    /// removed through [`KeyInstaller::remove_group_key`].
    pub fn remove_peer_key(
        &mut self,
        req: RemoveKeyReq,
        sta_idx: u16,
        session: &mut Session,
        ports: Ports<'_>,
    ) -> Result<u16> {
        let origin = origin(KeyOp::RemoveKey, &req.peer_mac, 0, session);

        if req.ed_type.is_wep() && req.wep_type == WepType::Static {
            let err = LimError::invalid(
                "static WEP keys must be removed through the BSS interface",
            );
            return Err(fail(ports.sme, session, origin, err));
        }
        if let Err(err) = check_key_id(req.key_id).and_then(|_| self.reserve()) {
            return Err(fail(ports.sme, session, origin, err));
        }

        let body = CtrlMsgBody::RemoveStaKey(RemoveStaKeyParams {
            sta_idx,
            enc_type: req.ed_type,
            key_id: req.key_id,
            unicast: req.unicast,
            session_id: session.session_id,
        });

        self.post(body, MlmState::WtRemoveStaKey, origin, session, ports)
    }

    /// Reconcile a device reply with its request and confirm it.
    ///
    /// The session resumes its pre-request MLM state only once its last
    /// outstanding request is answered.
    ///
    /// Returns `false` for a token with no outstanding request (late or
    /// duplicate reply); nothing is confirmed in that case.
    pub fn complete(
        &mut self,
        rsp: HalResponse,
        sessions: &mut SessionTable,
        sme: &mut dyn SmeSink,
    ) -> bool {
        let Some(mut origin) = self.pending.remove(&rsp.dialog_token) else {
            warn!(
                "Reply for unknown dialog token {} (status {}) ignored",
                rsp.dialog_token, rsp.status
            );
            return false;
        };

        let result = if rsp.status == HalResponse::SUCCESS {
            ResultCode::Success
        } else {
            error!(
                "Device failed {:?} for {} with status 0x{:x}",
                origin.op, origin.peer_mac, rsp.status
            );
            ResultCode::DeviceFailure { status: rsp.status }
        };

        if origin.state_saved && self.outstanding_for(origin.session_id) > 0 {
            debug!(
                "session {} still has key requests outstanding",
                origin.session_id
            );
            origin.state_saved = false;
        }

        let session = sessions.get_mut(origin.session_id);
        post_key_cnf(sme, session, origin, result);
        true
    }

    fn reserve(&self) -> Result<()> {
        if self.pending.len() >= self.max_pending {
            error!(
                "No room for another key request ({} outstanding)",
                self.pending.len()
            );
            return Err(LimError::ResourcesUnavailable);
        }
        Ok(())
    }

    fn outstanding_for(&self, session_id: u8) -> usize {
        self.pending
            .values()
            .filter(|o| o.session_id == session_id)
            .count()
    }

    fn alloc_token(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if !self.pending.contains_key(&token) {
                return Ok(token);
            }
        }
        error!("Every dialog token is in use");
        Err(LimError::ResourcesUnavailable)
    }

    /// Move the session into `wait`. Only the first outstanding request of
    /// a session saves the state to resume; a request that overlaps it keeps
    /// the saved state.
    fn enter_key_wait(&self, session: &mut Session, wait: MlmState) {
        if session.mlm_state.is_key_wait() && self.outstanding_for(session.session_id) > 0 {
            debug!(
                "session {}: MLM {} -> {}, resume state {} kept",
                session.session_id, session.mlm_state, wait, session.prev_mlm_state
            );
            session.mlm_state = wait;
        } else {
            session.enter_wait_state(wait);
        }
    }

    /// Post a validated request. The session enters `wait` only once the
    /// device queue has accepted it.
    fn post(
        &mut self,
        body: CtrlMsgBody,
        wait: MlmState,
        mut origin: KeyRequestOrigin,
        session: &mut Session,
        ports: Ports<'_>,
    ) -> Result<u16> {
        let token = match self.alloc_token() {
            Ok(token) => token,
            Err(err) => return Err(fail(ports.sme, session, origin, err)),
        };
        let msg = CtrlMsg {
            dialog_token: token,
            body,
        };
        info!("Sending {} for {}", msg, origin.peer_mac);

        match ports.hal.post(msg) {
            Ok(()) => {
                self.enter_key_wait(session, wait);
                origin.state_saved = true;
                self.pending.insert(token, origin);
                Ok(token)
            }
            Err(e) => {
                error!("Posting key request to device failed: {}", e);
                Err(fail(ports.sme, session, origin, LimError::TransportFailure(e.status)))
            }
        }
    }
}

fn origin(op: KeyOp, peer_mac: &MacAddr, aid: u16, session: &Session) -> KeyRequestOrigin {
    KeyRequestOrigin {
        op,
        peer_mac: *peer_mac,
        session_id: session.session_id,
        aid,
        state_saved: false,
    }
}

/// Confirm a request that failed locally and hand the error back
fn fail(
    sme: &mut dyn SmeSink,
    session: &mut Session,
    origin: KeyRequestOrigin,
    err: LimError,
) -> LimError {
    warn!("{:?} request for {} failed: {}", origin.op, origin.peer_mac, err);
    post_key_cnf(sme, Some(session), origin, ResultCode::from(&err));
    err
}

fn check_key_id(key_id: u8) -> Result<()> {
    if key_id as usize >= MAX_NUM_DEFAULT_KEYS {
        return Err(LimError::invalid(format!("key id {} out of range 0..=3", key_id)));
    }
    Ok(())
}

fn read_single_tid_rc(cfg: &dyn CfgSource) -> u8 {
    match cfg.get_int(CfgItem::SingleTidRc) {
        Ok(value) => value as u8,
        Err(e) => {
            warn!("{}; sending single TID RC = 0", e);
            0
        }
    }
}
