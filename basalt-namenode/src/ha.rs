//! High-availability controller for the metadata pair.
//!
//! Two namenodes run symmetrically; one is leader, one follower. The
//! controller drives a term-based election (randomised timeouts, one vote
//! per term), emits leader heartbeats, and ships op-log suffixes to the
//! follower so it can take over without losing committed namespace state.
//!
//! In a two-node cluster a candidate needs its own vote plus the peer's;
//! when the peer is unreachable the candidate wins uncontested, which is
//! what makes failover possible after the leader dies.

use crate::manager::Manager;
use crate::oplog::{MetaOp, OpLog, OpLogEntry};
use basalt_core::error::{DfsError, Result};
use basalt_core::settings::Settings;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const META_CURRENT_TERM: &str = "current_term";
const META_VOTED_FOR: &str = "voted_for";
const META_APPLIED_INDEX: &str = "applied_index";

const SYNC_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeat {
    pub term: u64,
    pub leader_id: String,
    pub leader_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHeartbeatResponse {
    pub term: u64,
    pub success: bool,
    /// Index of the last op-log entry this node has applied; the leader
    /// resumes shipping from here after a reconnect.
    pub ack_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub term: u64,
    pub leader_id: String,
    pub entries: Vec<OpLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub term: u64,
    pub success: bool,
    pub ack_index: u64,
}

struct HaInner {
    role: NodeRole,
    current_term: u64,
    voted_for: Option<String>,
    leader_hint: Option<String>,
    last_leader_contact: Instant,
    leader_since: Option<Instant>,
    /// Leader's view of the follower's applied index.
    follower_ack: u64,
    /// This node's own applied index (meaningful as follower).
    applied_index: u64,
}

pub struct HaController {
    node_id: String,
    endpoint: String,
    peer: Option<String>,
    manager: Manager,
    oplog: Arc<Mutex<OpLog>>,
    inner: Mutex<HaInner>,
    client: reqwest::Client,
    settings: Settings,
}

impl HaController {
    pub fn new(
        node_id: String,
        endpoint: String,
        peer: Option<String>,
        manager: Manager,
        oplog: Arc<Mutex<OpLog>>,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let store = manager.store();
        let current_term = store
            .get_meta(META_CURRENT_TERM)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let voted_for = store.get_meta(META_VOTED_FOR)?.filter(|v| !v.is_empty());
        let applied_index = store
            .get_meta(META_APPLIED_INDEX)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        // Without a peer this node is trivially the leader.
        let (role, leader_hint, leader_since) = if peer.is_none() {
            (NodeRole::Leader, Some(endpoint.clone()), Some(Instant::now()))
        } else {
            (NodeRole::Follower, None, None)
        };

        Ok(Arc::new(Self {
            node_id,
            endpoint,
            peer,
            manager,
            oplog,
            inner: Mutex::new(HaInner {
                role,
                current_term,
                voted_for,
                leader_hint,
                last_leader_contact: Instant::now(),
                leader_since,
                follower_ack: 0,
                applied_index,
            }),
            client: reqwest::Client::new(),
            settings,
        }))
    }

    fn locked(&self) -> Result<MutexGuard<'_, HaInner>> {
        self.inner
            .lock()
            .map_err(|_| DfsError::Internal("ha state lock poisoned".to_string()))
    }

    fn locked_oplog(&self) -> Result<MutexGuard<'_, OpLog>> {
        self.oplog
            .lock()
            .map_err(|_| DfsError::Internal("oplog lock poisoned".to_string()))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.locked().map(|i| i.role).unwrap_or(NodeRole::Follower)
    }

    pub fn current_term(&self) -> u64 {
        self.locked().map(|i| i.current_term).unwrap_or(0)
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.locked().ok().and_then(|i| i.leader_hint.clone())
    }

    pub fn is_leader(&self) -> bool {
        self.role() == NodeRole::Leader
    }

    /// How long this node has held leadership, if it is the leader.
    pub fn leadership_age(&self) -> Option<Duration> {
        self.locked()
            .ok()
            .and_then(|i| i.leader_since.map(|t| t.elapsed()))
    }

    /// Mutating operations are only accepted on the leader.
    pub fn ensure_leader(&self) -> Result<()> {
        let inner = self.locked()?;
        if inner.role == NodeRole::Leader {
            Ok(())
        } else {
            Err(DfsError::NotLeader {
                leader: inner.leader_hint.clone(),
            })
        }
    }

    /// Record a committed mutation in the op log under the current term.
    pub fn record(&self, op: MetaOp) {
        let term = self.current_term();
        match self.locked_oplog().and_then(|mut log| log.append(term, op)) {
            Ok(_) => {}
            Err(err) => tracing::error!("failed to append to oplog: {err}"),
        }
    }

    // === peer RPC handlers ===

    pub fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut inner = self.locked()?;

        if request.term < inner.current_term {
            return Ok(VoteResponse {
                term: inner.current_term,
                vote_granted: false,
            });
        }
        if request.term > inner.current_term {
            inner.current_term = request.term;
            inner.voted_for = None;
            inner.role = NodeRole::Follower;
            inner.leader_since = None;
            self.persist_term(&inner)?;
        }

        let grant = match &inner.voted_for {
            None => true,
            Some(candidate) => candidate == &request.candidate_id,
        };
        if grant {
            inner.voted_for = Some(request.candidate_id.clone());
            inner.last_leader_contact = Instant::now();
            self.persist_term(&inner)?;
            tracing::info!(
                "granted vote to {} for term {}",
                request.candidate_id,
                inner.current_term
            );
        }

        Ok(VoteResponse {
            term: inner.current_term,
            vote_granted: grant,
        })
    }

    pub fn handle_peer_heartbeat(&self, request: PeerHeartbeat) -> Result<PeerHeartbeatResponse> {
        let mut inner = self.locked()?;

        if request.term < inner.current_term {
            return Ok(PeerHeartbeatResponse {
                term: inner.current_term,
                success: false,
                ack_index: inner.applied_index,
            });
        }
        if request.term > inner.current_term {
            inner.current_term = request.term;
            inner.voted_for = None;
            self.persist_term(&inner)?;
        }
        if inner.role == NodeRole::Leader {
            tracing::warn!(
                "leader {} of term {} observed, stepping down",
                request.leader_id,
                request.term
            );
        }
        inner.role = NodeRole::Follower;
        inner.leader_since = None;
        inner.leader_hint = Some(request.leader_endpoint);
        inner.last_leader_contact = Instant::now();

        Ok(PeerHeartbeatResponse {
            term: inner.current_term,
            success: true,
            ack_index: inner.applied_index,
        })
    }

    /// Apply op-log entries shipped by the leader, strictly in order.
    pub fn handle_sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        {
            let mut inner = self.locked()?;
            if request.term < inner.current_term {
                return Ok(SyncResponse {
                    term: inner.current_term,
                    success: false,
                    ack_index: inner.applied_index,
                });
            }
            if request.term > inner.current_term {
                inner.current_term = request.term;
                inner.voted_for = None;
                self.persist_term(&inner)?;
            }
            inner.role = NodeRole::Follower;
            inner.last_leader_contact = Instant::now();
        }

        let mut applied = self.locked()?.applied_index;
        let mut in_order = true;
        for entry in request.entries {
            if entry.index <= applied {
                continue;
            }
            if entry.index != applied + 1 {
                // Gap: the leader will resend from our ack.
                in_order = false;
                break;
            }
            self.manager.apply(&entry.op)?;
            applied = entry.index;
            self.locked_oplog()?.append_entry(entry)?;
        }

        let mut inner = self.locked()?;
        inner.applied_index = applied;
        self.manager
            .store()
            .set_meta(META_APPLIED_INDEX, &applied.to_string())?;

        Ok(SyncResponse {
            term: inner.current_term,
            success: in_order,
            ack_index: applied,
        })
    }

    // === background loops ===

    /// Election timer: when no leader heartbeat arrives within a
    /// randomised timeout, stand for election.
    pub async fn election_loop(self: Arc<Self>) {
        if self.peer.is_none() {
            return;
        }
        loop {
            let timeout = self.random_election_timeout();
            tokio::time::sleep(timeout).await;

            let should_stand = match self.locked() {
                Ok(inner) => {
                    inner.role != NodeRole::Leader
                        && inner.last_leader_contact.elapsed() >= timeout
                }
                Err(_) => false,
            };
            if should_stand {
                self.start_election().await;
            }
        }
    }

    /// Leader side: heartbeat the peer and ship any op-log suffix it is
    /// missing.
    pub async fn leader_loop(self: Arc<Self>) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.settings.leader_heartbeat_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !self.is_leader() {
                continue;
            }

            let heartbeat = PeerHeartbeat {
                term: self.current_term(),
                leader_id: self.node_id.clone(),
                leader_endpoint: self.endpoint.clone(),
            };
            let url = format!("{peer}/peer/heartbeat");
            let response = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(self.settings.rpc_timeout_secs))
                .json(&heartbeat)
                .send()
                .await;

            let ack = match response {
                Ok(response) => match response.json::<PeerHeartbeatResponse>().await {
                    Ok(body) => {
                        if body.term > self.current_term() {
                            self.step_down(body.term);
                            continue;
                        }
                        body.ack_index
                    }
                    Err(err) => {
                        tracing::debug!("peer heartbeat decode failed: {err}");
                        continue;
                    }
                },
                Err(err) => {
                    tracing::debug!("peer unreachable: {err}");
                    continue;
                }
            };

            if let Ok(mut inner) = self.locked() {
                inner.follower_ack = ack;
            }
            if let Err(err) = self.ship_entries(&peer).await {
                tracing::debug!("metadata sync to peer failed: {err}");
            }
        }
    }

    async fn ship_entries(&self, peer: &str) -> Result<()> {
        loop {
            let ack = self.locked()?.follower_ack;
            let batch = self.locked_oplog()?.entries_from(ack + 1, SYNC_BATCH);
            if batch.is_empty() {
                return Ok(());
            }
            let batch_len = batch.len();

            let request = SyncRequest {
                term: self.current_term(),
                leader_id: self.node_id.clone(),
                entries: batch,
            };
            let url = format!("{peer}/peer/sync");
            let response = self
                .client
                .post(&url)
                .timeout(Duration::from_secs(self.settings.rpc_timeout_secs))
                .json(&request)
                .send()
                .await
                .map_err(|e| DfsError::Transient(e.to_string()))?;
            let body: SyncResponse = response.json().await.map_err(DfsError::http)?;

            if body.term > self.current_term() {
                self.step_down(body.term);
                return Ok(());
            }
            {
                let mut inner = self.locked()?;
                inner.follower_ack = body.ack_index;
            }
            if !body.success || body.ack_index < ack + batch_len as u64 {
                // Follower could not apply the whole batch; retry next tick.
                return Ok(());
            }
        }
    }

    async fn start_election(&self) {
        let term = {
            let mut inner = match self.locked() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            inner.current_term += 1;
            inner.role = NodeRole::Candidate;
            inner.voted_for = Some(self.node_id.clone());
            inner.leader_hint = None;
            if let Err(err) = self.persist_term(&inner) {
                tracing::error!("cannot persist election term: {err}");
                return;
            }
            inner.current_term
        };
        tracing::info!("standing for election in term {term}");

        let Some(peer) = self.peer.clone() else {
            self.become_leader(term);
            return;
        };

        let request = VoteRequest {
            term,
            candidate_id: self.node_id.clone(),
        };
        let url = format!("{peer}/peer/vote");
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.settings.rpc_timeout_secs))
            .json(&request)
            .send()
            .await;

        match response {
            Ok(response) => match response.json::<VoteResponse>().await {
                Ok(body) if body.term > term => self.step_down(body.term),
                Ok(body) if body.vote_granted => self.become_leader(term),
                Ok(_) => {
                    tracing::info!("vote denied for term {term}, will retry after timeout");
                }
                Err(err) => {
                    tracing::warn!("vote response decode failed: {err}");
                }
            },
            // Unreachable peer: the election is uncontested.
            Err(_) => {
                tracing::warn!("peer unreachable during election, assuming leadership");
                self.become_leader(term);
            }
        }
    }

    fn become_leader(&self, term: u64) {
        if let Ok(mut inner) = self.locked() {
            if inner.current_term != term || inner.role == NodeRole::Leader {
                return;
            }
            inner.role = NodeRole::Leader;
            inner.leader_hint = Some(self.endpoint.clone());
            inner.leader_since = Some(Instant::now());
            inner.follower_ack = 0;
            tracing::info!("became metadata leader for term {term}");
        }
    }

    fn step_down(&self, term: u64) {
        if let Ok(mut inner) = self.locked() {
            if term > inner.current_term {
                inner.current_term = term;
                inner.voted_for = None;
                if let Err(err) = self.persist_term(&inner) {
                    tracing::error!("cannot persist term on step-down: {err}");
                }
            }
            inner.role = NodeRole::Follower;
            inner.leader_since = None;
            inner.last_leader_contact = Instant::now();
            tracing::info!("stepped down to follower in term {}", inner.current_term);
        }
    }

    fn persist_term(&self, inner: &HaInner) -> Result<()> {
        let store = self.manager.store();
        store.set_meta(META_CURRENT_TERM, &inner.current_term.to_string())?;
        match &inner.voted_for {
            Some(candidate) => store.set_meta(META_VOTED_FOR, candidate)?,
            None => store.set_meta(META_VOTED_FOR, "")?,
        }
        Ok(())
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.settings.election_timeout_min_ms;
        let max = self.settings.election_timeout_max_ms.max(min + 1);
        let ms = rand::thread_rng().gen_range(min..max);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetadataStore;

    fn controller(peer: Option<&str>) -> (tempfile::TempDir, Arc<HaController>) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();
        let manager = Manager::new(store, Settings::default());
        let oplog = Arc::new(Mutex::new(
            OpLog::open(dir.path().join("metadata.oplog")).unwrap(),
        ));
        let ha = HaController::new(
            "nn-1".to_string(),
            "http://127.0.0.1:9000".to_string(),
            peer.map(str::to_string),
            manager,
            oplog,
            Settings::default(),
        )
        .unwrap();
        (dir, ha)
    }

    #[test]
    fn test_single_node_is_leader() {
        let (_d, ha) = controller(None);
        assert!(ha.is_leader());
        assert!(ha.ensure_leader().is_ok());
    }

    #[test]
    fn test_paired_node_starts_as_follower() {
        let (_d, ha) = controller(Some("http://127.0.0.1:9001"));
        assert_eq!(ha.role(), NodeRole::Follower);
        let err = ha.ensure_leader().unwrap_err();
        assert!(matches!(err, DfsError::NotLeader { .. }));
    }

    #[test]
    fn test_vote_once_per_term() {
        let (_d, ha) = controller(Some("http://127.0.0.1:9001"));
        let first = ha
            .handle_vote(VoteRequest {
                term: 3,
                candidate_id: "nn-2".to_string(),
            })
            .unwrap();
        assert!(first.vote_granted);
        assert_eq!(first.term, 3);

        // Same term, different candidate: denied.
        let second = ha
            .handle_vote(VoteRequest {
                term: 3,
                candidate_id: "nn-3".to_string(),
            })
            .unwrap();
        assert!(!second.vote_granted);

        // Re-request by the same candidate: still granted.
        let again = ha
            .handle_vote(VoteRequest {
                term: 3,
                candidate_id: "nn-2".to_string(),
            })
            .unwrap();
        assert!(again.vote_granted);
    }

    #[test]
    fn test_stale_vote_rejected() {
        let (_d, ha) = controller(Some("http://127.0.0.1:9001"));
        ha.handle_vote(VoteRequest {
            term: 5,
            candidate_id: "nn-2".to_string(),
        })
        .unwrap();
        let stale = ha
            .handle_vote(VoteRequest {
                term: 2,
                candidate_id: "nn-3".to_string(),
            })
            .unwrap();
        assert!(!stale.vote_granted);
        assert_eq!(stale.term, 5);
    }

    #[test]
    fn test_heartbeat_adopts_leader() {
        let (_d, ha) = controller(Some("http://127.0.0.1:9001"));
        let response = ha
            .handle_peer_heartbeat(PeerHeartbeat {
                term: 4,
                leader_id: "nn-2".to_string(),
                leader_endpoint: "http://127.0.0.1:9001".to_string(),
            })
            .unwrap();
        assert!(response.success);
        assert_eq!(ha.current_term(), 4);
        assert_eq!(
            ha.leader_hint().as_deref(),
            Some("http://127.0.0.1:9001")
        );
    }

    #[test]
    fn test_sync_applies_in_order() {
        let (_d, ha) = controller(Some("http://127.0.0.1:9001"));
        let entries = vec![
            OpLogEntry {
                index: 1,
                term: 1,
                op: MetaOp::Mkdir {
                    path: "/a".to_string(),
                    owner: None,
                },
            },
            OpLogEntry {
                index: 2,
                term: 1,
                op: MetaOp::Mkdir {
                    path: "/a/b".to_string(),
                    owner: None,
                },
            },
        ];
        let response = ha
            .handle_sync(SyncRequest {
                term: 1,
                leader_id: "nn-2".to_string(),
                entries,
            })
            .unwrap();
        assert!(response.success);
        assert_eq!(response.ack_index, 2);
        assert!(ha.manager.list_directory("/a/b").is_ok());

        // A gap is refused and the ack names the resume point.
        let gapped = ha
            .handle_sync(SyncRequest {
                term: 1,
                leader_id: "nn-2".to_string(),
                entries: vec![OpLogEntry {
                    index: 5,
                    term: 1,
                    op: MetaOp::Mkdir {
                        path: "/c".to_string(),
                        owner: None,
                    },
                }],
            })
            .unwrap();
        assert!(!gapped.success);
        assert_eq!(gapped.ack_index, 2);
    }

    #[test]
    fn test_term_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("metadata.db");
        let log = dir.path().join("metadata.oplog");
        {
            let store = MetadataStore::open(&db).unwrap();
            let manager = Manager::new(store, Settings::default());
            let oplog = Arc::new(Mutex::new(OpLog::open(&log).unwrap()));
            let ha = HaController::new(
                "nn-1".to_string(),
                "http://127.0.0.1:9000".to_string(),
                Some("http://127.0.0.1:9001".to_string()),
                manager,
                oplog,
                Settings::default(),
            )
            .unwrap();
            ha.handle_vote(VoteRequest {
                term: 9,
                candidate_id: "nn-2".to_string(),
            })
            .unwrap();
        }

        let store = MetadataStore::open(&db).unwrap();
        let manager = Manager::new(store, Settings::default());
        let oplog = Arc::new(Mutex::new(OpLog::open(&log).unwrap()));
        let ha = HaController::new(
            "nn-1".to_string(),
            "http://127.0.0.1:9000".to_string(),
            Some("http://127.0.0.1:9001".to_string()),
            manager,
            oplog,
            Settings::default(),
        )
        .unwrap();
        assert_eq!(ha.current_term(), 9);
    }
}
