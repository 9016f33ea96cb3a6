use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Coarse lifecycle phase of the daemon.
///
/// ```text
/// inactive -> starting | active
/// starting -> active | error | inactive
/// active   -> degraded | stopping | error
/// degraded -> active | stopping | error
/// stopping -> inactive | error
/// error    -> inactive | starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Inactive,
    Starting,
    Active,
    Degraded,
    Stopping,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Inactive => "inactive",
            AgentState::Starting => "starting",
            AgentState::Active => "active",
            AgentState::Degraded => "degraded",
            AgentState::Stopping => "stopping",
            AgentState::Error => "error",
        }
    }

    /// Edges of the lifecycle table. Self-loops are not edges.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Inactive, Starting | Active)
                | (Starting, Active | Error | Inactive)
                | (Active, Degraded | Stopping | Error)
                | (Degraded, Active | Stopping | Error)
                | (Stopping, Inactive | Error)
                | (Error, Inactive | Starting)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid agent state transition: {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    None,
    UserPass,
}

/// Capabilities discovered by a probe. `auth: None` means unknown.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct ProxyFeatures {
    pub auth: Option<AuthMethod>,
    pub ipv6: bool,
    /// Reserved: the probe only records `udp_ok`, never this flag.
    pub udp: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub reachable: bool,
    pub socks_ok: bool,
    pub connect_ok: bool,
    pub udp_ok: bool,
    pub latencies_ms: BTreeMap<String, u64>,
    pub features: ProxyFeatures,
    pub warnings: Vec<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct TunSnapshot {
    pub name: String,
    pub up: bool,
    pub mtu: u32,
    pub local_ip: String,
    pub peer_ip: String,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub default_via: String,
    pub lan_cidrs: Vec<String>,
    pub bypass_hosts: Vec<String>,
    pub proxy_host_route: bool,
    /// Default gateway seen before the swap, used for restore.
    pub original_gateway: String,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Tun2SocksSnapshot {
    pub pid: u32,
    pub uptime_sec: u64,
    pub tcp_ok: bool,
    pub udp_ok: bool,
}

/// Point-in-time copy of [`State`]. Owns all of its data.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    #[serde(rename = "state")]
    pub agent_state: AgentState,
    pub started_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub tun: TunSnapshot,
    pub routes: RouteSnapshot,
    pub tun2socks: Tun2SocksSnapshot,
    pub last_probe: ProbeSummary,
}

/// Shared daemon state. One instance per process, handed around as `Arc<State>`.
///
/// Every method holds the lock only for field copies and assignments.
#[derive(Debug, Default)]
pub struct State {
    inner: RwLock<Snapshot>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().clone()
    }

    pub fn agent_state(&self) -> AgentState {
        self.inner.read().agent_state
    }

    /// Moves the lifecycle to `next`.
    ///
    /// The first entry into `Active` stamps `started_at`; entering `Inactive`
    /// clears it. A transition to the current state succeeds without effect.
    pub fn set_agent_state(&self, next: AgentState) -> Result<(), StateError> {
        let from = {
            let mut inner = self.inner.write();
            let from = inner.agent_state;
            if from == next {
                return Ok(());
            }
            if !from.can_transition_to(next) {
                drop(inner);
                warn!(%from, to = %next, "rejected agent state transition");
                return Err(StateError::InvalidTransition { from, to: next });
            }
            match next {
                AgentState::Active if inner.started_at.is_none() => {
                    inner.started_at = Some(Utc::now());
                }
                AgentState::Inactive => inner.started_at = None,
                _ => {}
            }
            inner.agent_state = next;
            from
        };
        info!(%from, to = %next, "agent state changed");
        Ok(())
    }

    /// Time since the first activation of this run, zero if never started.
    pub fn uptime(&self) -> Duration {
        let started_at = self.inner.read().started_at;
        started_at
            .and_then(|t| (Utc::now() - t).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn append_warning(&self, msg: impl Into<String>) {
        let msg = msg.into();
        if msg.is_empty() {
            return;
        }
        self.inner.write().warnings.push(msg);
    }

    pub fn clear_warnings(&self) {
        self.inner.write().warnings.clear();
    }

    pub fn update_tun(&self, tun: TunSnapshot) {
        self.inner.write().tun = tun;
    }

    /// Callers pass the complete view; there is no field-level merge.
    pub fn update_routes(&self, routes: RouteSnapshot) {
        self.inner.write().routes = routes;
    }

    pub fn update_tun2socks(&self, tun2socks: Tun2SocksSnapshot) {
        self.inner.write().tun2socks = tun2socks;
    }

    pub fn update_probe(&self, summary: ProbeSummary) {
        self.inner.write().last_probe = summary;
    }

    /// Drops warnings and subsystem snapshots. With `clear_lifecycle` the agent
    /// also returns to `Inactive` with no start time.
    pub fn reset(&self, clear_lifecycle: bool) {
        {
            let mut inner = self.inner.write();
            let (agent_state, started_at) = if clear_lifecycle {
                (AgentState::Inactive, None)
            } else {
                (inner.agent_state, inner.started_at)
            };
            *inner = Snapshot {
                agent_state,
                started_at,
                ..Snapshot::default()
            };
        }
        info!(clear_lifecycle, "state reset");
    }
}
