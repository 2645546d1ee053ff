//! Per-BSS session context shared by the auth and key install paths

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

use crate::config::{CfgItem, CfgSource};
use crate::mac::MacAddr;

/// Role the local entity plays in its BSS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemRole {
    Ap,
    Sta,
    Ibss,
}

/// MAC authentication algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    Open,
    Shared,
    /// AP accepts either algorithm
    AutoSwitch,
}

/// MLM state machine positions this core enters or restores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MlmState {
    Idle,
    BssStarted,
    LinkEstablished,
    WtAuthFrame2,
    WtSetBssKey,
    WtSetStaKey,
    WtSetStaBcastKey,
    WtRemoveBssKey,
    WtRemoveStaKey,
}

impl MlmState {
    pub fn is_key_wait(self) -> bool {
        matches!(
            self,
            MlmState::WtSetBssKey
                | MlmState::WtSetStaKey
                | MlmState::WtSetStaBcastKey
                | MlmState::WtRemoveBssKey
                | MlmState::WtRemoveStaKey
        )
    }
}

impl fmt::Display for MlmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SmeState {
    Idle,
    WtPreAuth,
}

/// Session context the protocol reads addressing fields from
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: u8,
    pub bss_idx: u8,
    pub bssid: MacAddr,
    pub role: SystemRole,
    pub mlm_state: MlmState,
    pub prev_mlm_state: MlmState,
    pub sme_state: SmeState,
    pub auth_type: AuthType,
    pub privacy: bool,
    /// Channel the STA switched to for pre-authentication, if any
    pub preauth_channel: Option<u8>,
}

impl Session {
    pub fn new(session_id: u8, bss_idx: u8, bssid: MacAddr, role: SystemRole) -> Self {
        let mlm_state = match role {
            SystemRole::Ap | SystemRole::Ibss => MlmState::BssStarted,
            SystemRole::Sta => MlmState::Idle,
        };
        Self {
            session_id,
            bss_idx,
            bssid,
            role,
            mlm_state,
            prev_mlm_state: mlm_state,
            sme_state: SmeState::Idle,
            auth_type: AuthType::Open,
            privacy: false,
            preauth_channel: None,
        }
    }

    /// Save the current state and move to `state`
    pub fn enter_wait_state(&mut self, state: MlmState) {
        self.prev_mlm_state = self.mlm_state;
        self.mlm_state = state;
        debug!(
            "session {}: MLM {} -> {}",
            self.session_id, self.prev_mlm_state, self.mlm_state
        );
    }

    pub fn restore_prev_mlm_state(&mut self) {
        debug!(
            "session {}: MLM {} restored to {}",
            self.session_id, self.mlm_state, self.prev_mlm_state
        );
        self.mlm_state = self.prev_mlm_state;
    }

    /// Whether `auth_type` may be used for MAC authentication on this session.
    ///
    /// An AP answers from its own session policy; other roles consult the
    /// configuration store. Shared key additionally requires privacy.
    pub fn is_auth_algo_supported(&self, auth_type: AuthType, cfg: &dyn CfgSource) -> bool {
        let is_ap = self.role == SystemRole::Ap;
        match auth_type {
            AuthType::Open if is_ap => {
                matches!(self.auth_type, AuthType::Open | AuthType::AutoSwitch)
            }
            AuthType::Open => read_flag(cfg, CfgItem::OpenSystemAuthEnable),
            AuthType::Shared | AuthType::AutoSwitch if is_ap => {
                matches!(self.auth_type, AuthType::Shared | AuthType::AutoSwitch) && self.privacy
            }
            AuthType::Shared | AuthType::AutoSwitch => {
                read_flag(cfg, CfgItem::SharedKeyAuthEnable)
                    && read_flag(cfg, CfgItem::PrivacyEnabled)
            }
        }
    }
}

fn read_flag(cfg: &dyn CfgSource, item: CfgItem) -> bool {
    match cfg.get_int(item) {
        Ok(value) => value > 0,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

/// Sessions indexed by session id
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.retain(|s| s.session_id != session.session_id);
        self.sessions.push(session);
    }

    pub fn get(&self, session_id: u8) -> Option<&Session> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn get_mut(&mut self, session_id: u8) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.session_id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CfgStore;

    fn ap_session(auth_type: AuthType, privacy: bool) -> Session {
        let mut s = Session::new(1, 0, MacAddr::ZERO, SystemRole::Ap);
        s.auth_type = auth_type;
        s.privacy = privacy;
        s
    }

    #[test]
    fn test_wait_state_round_trip() {
        let mut s = Session::new(1, 0, MacAddr::ZERO, SystemRole::Sta);
        s.mlm_state = MlmState::LinkEstablished;
        s.enter_wait_state(MlmState::WtSetStaKey);
        assert!(s.mlm_state.is_key_wait());
        s.restore_prev_mlm_state();
        assert_eq!(s.mlm_state, MlmState::LinkEstablished);
    }

    #[test]
    fn test_ap_uses_session_policy() {
        let cfg = CfgStore::default();
        let s = ap_session(AuthType::Open, false);
        assert!(s.is_auth_algo_supported(AuthType::Open, &cfg));
        assert!(!s.is_auth_algo_supported(AuthType::Shared, &cfg));

        let s = ap_session(AuthType::AutoSwitch, true);
        assert!(s.is_auth_algo_supported(AuthType::Open, &cfg));
        assert!(s.is_auth_algo_supported(AuthType::Shared, &cfg));

        let s = ap_session(AuthType::Shared, false);
        assert!(!s.is_auth_algo_supported(AuthType::Shared, &cfg));
    }

    #[test]
    fn test_sta_uses_cfg_and_fails_closed() {
        let s = Session::new(1, 0, MacAddr::ZERO, SystemRole::Sta);
        let cfg = CfgStore {
            open_system_auth_enable: Some(1),
            shared_key_auth_enable: Some(1),
            privacy_enabled: Some(0),
            ..Default::default()
        };
        assert!(s.is_auth_algo_supported(AuthType::Open, &cfg));
        assert!(!s.is_auth_algo_supported(AuthType::Shared, &cfg));

        let empty = CfgStore::default();
        assert!(!s.is_auth_algo_supported(AuthType::Open, &empty));
    }

    #[test]
    fn test_session_table_replaces_by_id() {
        let mut table = SessionTable::new();
        table.insert(Session::new(1, 0, MacAddr::ZERO, SystemRole::Ap));
        table.insert(Session::new(1, 5, MacAddr::ZERO, SystemRole::Ap));
        assert_eq!(table.get(1).unwrap().bss_idx, 5);
        assert!(table.get(2).is_none());
    }
}
