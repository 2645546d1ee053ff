//! Confirmations delivered to the SME
//!
//! Every key request produces exactly one confirmation, whether it failed
//! locally or was answered by the device. Posting a confirmation consumes
//! the request origin, so the request cannot be confirmed twice.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::ResultCode;
use crate::mac::MacAddr;
use crate::session::{AuthType, Session, SmeState, SystemRole};
use crate::timer::{TimerId, Timers};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SetKeysCnf {
    pub peer_mac: MacAddr,
    pub session_id: u8,
    pub result_code: ResultCode,
    /// Association id, only reported by an AP
    pub aid: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoveKeyCnf {
    pub peer_mac: MacAddr,
    pub session_id: u8,
    pub result_code: ResultCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthCnf {
    pub peer_mac: MacAddr,
    pub auth_type: AuthType,
    pub result_code: ResultCode,
    /// 802.11 status code from the peer's last auth frame
    pub prot_status: u16,
    pub session_id: u8,
}

/// Message posted to the SME inbound queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cnf", rename_all = "kebab-case")]
pub enum MlmConfirm {
    SetKeys(SetKeysCnf),
    RemoveKey(RemoveKeyCnf),
    Auth(AuthCnf),
}

impl MlmConfirm {
    pub fn result_code(&self) -> ResultCode {
        match self {
            MlmConfirm::SetKeys(c) => c.result_code,
            MlmConfirm::RemoveKey(c) => c.result_code,
            MlmConfirm::Auth(c) => c.result_code,
        }
    }
}

/// The management layer's single inbound message sink
pub trait SmeSink {
    fn post(&mut self, cnf: MlmConfirm);
}

impl SmeSink for Vec<MlmConfirm> {
    fn post(&mut self, cnf: MlmConfirm) {
        self.push(cnf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOp {
    SetKeys,
    RemoveKey,
}

/// What a key request needs to remember until it is confirmed
#[derive(Debug)]
pub struct KeyRequestOrigin {
    pub op: KeyOp,
    pub peer_mac: MacAddr,
    pub session_id: u8,
    pub aid: u16,
    /// Confirming this request resumes the saved MLM state
    pub state_saved: bool,
}

/// Build and deliver the confirmation for a key request.
///
/// Restores the session's previous MLM state first, so the state machine is
/// consistent by the time the SME sees the confirmation.
pub fn post_key_cnf(
    sme: &mut dyn SmeSink,
    session: Option<&mut Session>,
    origin: KeyRequestOrigin,
    result_code: ResultCode,
) {
    let mut is_ap = false;
    match session {
        Some(session) => {
            is_ap = session.role == SystemRole::Ap;
            if origin.state_saved {
                session.restore_prev_mlm_state();
            }
        }
        None => warn!(
            "session {} gone before {:?} confirmation for {}",
            origin.session_id, origin.op, origin.peer_mac
        ),
    }

    let cnf = match origin.op {
        KeyOp::SetKeys => MlmConfirm::SetKeys(SetKeysCnf {
            peer_mac: origin.peer_mac,
            session_id: origin.session_id,
            result_code,
            aid: is_ap.then_some(origin.aid),
        }),
        KeyOp::RemoveKey => MlmConfirm::RemoveKey(RemoveKeyCnf {
            peer_mac: origin.peer_mac,
            session_id: origin.session_id,
            result_code,
        }),
    };

    info!(
        "Posting {:?} confirmation for {} (session {}): {:?}",
        origin.op, origin.peer_mac, origin.session_id, result_code
    );
    sme.post(cnf);
}

/// Outstanding MLM-AUTH.request on a STA
#[derive(Debug, Clone)]
pub struct MlmAuthReq {
    pub peer_mac: MacAddr,
    pub auth_type: AuthType,
}

/// Finish an authentication attempt and report it to the SME.
///
/// Consumes the pending auth request, restores the pre-auth MLM state and
/// stops the auth failure timer for future activations.
pub fn restore_from_auth_state(
    result_code: ResultCode,
    prot_status: u16,
    session: &mut Session,
    auth_req: MlmAuthReq,
    timers: &mut dyn Timers,
    sme: &mut dyn SmeSink,
) {
    let cnf = AuthCnf {
        peer_mac: auth_req.peer_mac,
        auth_type: auth_req.auth_type,
        result_code,
        prot_status,
        session_id: session.session_id,
    };

    session.restore_prev_mlm_state();
    timers.deactivate(TimerId::AuthFailure);

    if session.sme_state == SmeState::WtPreAuth {
        session.preauth_channel = None;
    }

    info!(
        "Authentication with {} finished: {:?} (status {})",
        cnf.peer_mac, result_code, prot_status
    );
    sme.post(MlmConfirm::Auth(cnf));
}
