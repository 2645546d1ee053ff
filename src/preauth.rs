//! Pre-authentication registry
//!
//! Tracks peers that are part-way through a MAC authentication exchange.
//! On an AP a periodic sweep evicts stale entries with a two-generation
//! mark: the first pass marks an entry `seen`, the next pass evicts it.
//! Nothing clears `seen` on peer activity, so an entry lives for at most two
//! sweep intervals.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{CfgItem, CfgSource};
use crate::error::{LimError, Result};
use crate::mac::{MacAddr, ReasonCode};
use crate::session::{AuthType, SystemRole};
use crate::timer::{TimerId, TimerMode, Timers};

/// Where a peer is in the authentication sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthNodeState {
    /// Sent frame 2 with a challenge; waiting for the encrypted frame 3
    WaitFrame3,
    Authenticated,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreAuthEntry {
    pub peer_mac: MacAddr,
    pub auth_type: AuthType,
    /// STA slot correlating this entry with the device (AP only)
    pub auth_node_idx: Option<u16>,
    pub state: AuthNodeState,
    /// Challenge text sent in frame 2 of a shared-key exchange
    #[serde(skip)]
    pub challenge: Option<Vec<u8>>,
    /// Auth response timer for this peer is running
    pub timer_started: bool,
    pub seen: bool,
    pub freed: bool,
    pub created_at: DateTime<Utc>,
}

impl PreAuthEntry {
    pub fn new(peer_mac: MacAddr, auth_type: AuthType) -> Self {
        Self {
            peer_mac,
            auth_type,
            auth_node_idx: None,
            state: AuthNodeState::Authenticated,
            challenge: None,
            timer_started: false,
            seen: false,
            freed: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_node_idx(mut self, idx: u16) -> Self {
        self.auth_node_idx = Some(idx);
        self
    }

    pub fn with_challenge(mut self, challenge: Vec<u8>) -> Self {
        self.challenge = Some(challenge);
        self.state = AuthNodeState::WaitFrame3;
        self
    }
}

/// Association lookups and frame transmission needed by the sweep
pub trait SweepHost {
    fn is_associated(&self, peer: &MacAddr) -> bool;
    fn send_deauth(&mut self, peer: &MacAddr, reason: ReasonCode);
}

/// Registry of peers mid-authentication, unique by MAC address
#[derive(Debug)]
pub struct PreAuthRegistry {
    entries: HashMap<MacAddr, PreAuthEntry>,
    /// Most recently added first
    order: VecDeque<MacAddr>,
    role: SystemRole,
    sweep_enabled: bool,
}

impl PreAuthRegistry {
    pub fn new(role: SystemRole) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            role,
            sweep_enabled: false,
        }
    }

    /// Reset to empty. On an AP, also start the periodic sweep timer.
    ///
    /// A missing cleanup interval or a timer that cannot be created disables
    /// the sweep for this registry; the registry itself stays usable.
    pub fn init(&mut self, role: SystemRole, cfg: &dyn CfgSource, timers: &mut dyn Timers) {
        self.delete_all(timers);
        if self.sweep_enabled {
            timers.deactivate(TimerId::PreAuthCleanup);
        }
        self.role = role;
        self.sweep_enabled = false;

        if role != SystemRole::Ap {
            return;
        }

        let timeout_ms = match cfg.get_int(CfgItem::PreAuthCleanupTimeout) {
            Ok(ms) => ms,
            Err(e) => {
                error!("{}; pre-auth cleanup disabled", e);
                return;
            }
        };

        let period = Duration::from_millis(timeout_ms as u64);
        if let Err(e) = timers.activate(TimerId::PreAuthCleanup, period, TimerMode::Periodic) {
            error!("could not create pre-auth cleanup timer: {}", e);
            return;
        }

        self.sweep_enabled = true;
        info!("Created pre-auth cleanup timer ({:?})", period);
    }

    /// Insert at the front. An address that is already present is rejected.
    pub fn add(&mut self, entry: PreAuthEntry) -> Result<()> {
        if self.entries.contains_key(&entry.peer_mac) {
            return Err(LimError::invalid(format!(
                "{} already in pre-auth list",
                entry.peer_mac
            )));
        }
        debug!("Adding {} to pre-auth list", entry.peer_mac);
        self.order.push_front(entry.peer_mac);
        self.entries.insert(entry.peer_mac, entry);
        Ok(())
    }

    pub fn search(&self, peer: &MacAddr) -> Option<&PreAuthEntry> {
        self.entries.get(peer)
    }

    pub fn search_mut(&mut self, peer: &MacAddr) -> Option<&mut PreAuthEntry> {
        self.entries.get_mut(peer)
    }

    /// Unlink and release the entry for `peer`, returning it.
    ///
    /// A missing peer is a caller error: it is logged and otherwise ignored.
    pub fn delete(&mut self, peer: &MacAddr, timers: &mut dyn Timers) -> Option<PreAuthEntry> {
        let Some(mut entry) = self.unlink(peer) else {
            error!("peer {} not found in pre-auth list", peer);
            return None;
        };
        debug!(
            "Release pre-auth entry for {} (node {:?})",
            peer, entry.auth_node_idx
        );
        release(&mut entry, timers);
        Some(entry)
    }

    /// Release every entry, in registry order
    pub fn delete_all(&mut self, timers: &mut dyn Timers) -> usize {
        let mut released = 0;
        for peer in std::mem::take(&mut self.order) {
            if let Some(mut entry) = self.entries.remove(&peer) {
                release(&mut entry, timers);
                released += 1;
            }
        }
        if released > 0 {
            debug!("Released {} pre-auth entries", released);
        }
        released
    }

    /// Periodic cleanup pass (AP only). Returns the evicted entries.
    ///
    /// Entries already marked `seen` are evicted; an advisory deauth goes to
    /// each evicted peer that has no association. Everything else is marked.
    pub fn sweep(&mut self, timers: &mut dyn Timers, host: &mut dyn SweepHost) -> Vec<PreAuthEntry> {
        if self.role != SystemRole::Ap {
            debug!("Pre-auth sweep ignored in {:?} role", self.role);
            return Vec::new();
        }

        let mut kept = VecDeque::with_capacity(self.order.len());
        let mut evicted = Vec::new();

        for peer in std::mem::take(&mut self.order) {
            let seen = match self.entries.get_mut(&peer) {
                Some(entry) if !entry.seen => {
                    entry.seen = true;
                    false
                }
                Some(_) => true,
                None => continue,
            };

            if !seen {
                kept.push_back(peer);
                continue;
            }

            if let Some(mut entry) = self.entries.remove(&peer) {
                if !host.is_associated(&peer) {
                    host.send_deauth(&peer, ReasonCode::PrevAuthNotValid);
                }
                debug!("Release pre-auth entry for {} during periodic cleanup", peer);
                release(&mut entry, timers);
                evicted.push(entry);
            }
        }

        self.order = kept;
        if !evicted.is_empty() {
            info!(
                "Pre-auth cleanup evicted {} entries, {} remain",
                evicted.len(),
                self.order.len()
            );
        }
        evicted
    }

    /// Start the one-shot auth response timer for an AP entry
    pub fn arm_response_timer(
        &mut self,
        peer: &MacAddr,
        timers: &mut dyn Timers,
        timeout: Duration,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(peer)
            .ok_or_else(|| LimError::invalid(format!("{} not in pre-auth list", peer)))?;
        let idx = entry
            .auth_node_idx
            .ok_or_else(|| LimError::invalid(format!("{} has no auth node slot", peer)))?;

        timers.activate(TimerId::AuthResponse(idx), timeout, TimerMode::OneShot)?;
        entry.timer_started = true;
        Ok(())
    }

    /// Shared-key exchange finished: drop the challenge and stop the
    /// response timer
    pub fn mark_authenticated(&mut self, peer: &MacAddr, timers: &mut dyn Timers) -> Result<()> {
        let entry = self
            .entries
            .get_mut(peer)
            .ok_or_else(|| LimError::invalid(format!("{} not in pre-auth list", peer)))?;

        if entry.timer_started {
            if let Some(idx) = entry.auth_node_idx {
                timers.deactivate(TimerId::AuthResponse(idx));
            }
            entry.timer_started = false;
        }
        entry.state = AuthNodeState::Authenticated;
        entry.challenge = None;
        Ok(())
    }

    /// Find the entry owning auth node slot `idx`
    pub fn search_by_node_idx(&self, idx: u16) -> Option<&PreAuthEntry> {
        self.entries.values().find(|e| e.auth_node_idx == Some(idx))
    }

    /// Number of active pre-auth contexts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in registry order (most recently added first)
    pub fn iter(&self) -> impl Iterator<Item = &PreAuthEntry> {
        self.order.iter().filter_map(|peer| self.entries.get(peer))
    }

    pub fn sweep_enabled(&self) -> bool {
        self.sweep_enabled
    }

    fn unlink(&mut self, peer: &MacAddr) -> Option<PreAuthEntry> {
        let entry = self.entries.remove(peer)?;
        self.order.retain(|p| p != peer);
        Some(entry)
    }
}

/// Stop the entry's response timer and mark it freed. The entry must
/// already be unlinked.
fn release(entry: &mut PreAuthEntry, timers: &mut dyn Timers) {
    debug_assert!(!entry.freed, "pre-auth entry released twice");
    if entry.timer_started {
        if let Some(idx) = entry.auth_node_idx {
            timers.deactivate(TimerId::AuthResponse(idx));
        }
        entry.timer_started = false;
    }
    entry.freed = true;
}
