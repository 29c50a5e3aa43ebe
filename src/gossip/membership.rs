//! Heartbeat membership over UDP.
//!
//! Every tick a node bumps its own heartbeat and sends its whole member
//! table to its buddies plus one random member.  Tables merge by highest
//! `(incarnation, heartbeat)`, where the incarnation is fixed per process
//! start so a restarted node outranks its previous life at once.  Entries
//! that stop advancing are expired and tombstoned for a while so a stale
//! digest cannot bring them back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};

use super::{buddies, Member, Membership};
use crate::error::MembershipError;

const MAX_DATAGRAM: usize = 65_507;

/// Tombstones outlive the failure timeout by this factor before pruning.
const TOMBSTONE_FACTOR: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberState {
    member: Member,
    gossip_port: u16,
    /// Process start time in milliseconds.
    #[serde(default)]
    incarnation: u64,
    heartbeat: u64,
}

impl MemberState {
    fn version(&self) -> (u64, u64) {
        (self.incarnation, self.heartbeat)
    }
}

#[derive(Debug)]
struct Tombstone {
    version: (u64, u64),
    buried: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
struct Digest {
    from: String,
    members: Vec<MemberState>,
}

#[derive(Debug)]
struct Entry {
    state: MemberState,
    seen: Instant,
}

#[derive(Debug)]
struct Table {
    local: MemberState,
    peers: HashMap<String, Entry>,
    tombstones: HashMap<String, Tombstone>,
}

impl Table {
    fn new(local: MemberState) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    fn digest(&self) -> Digest {
        let mut members = vec![self.local.clone()];
        members.extend(self.peers.values().map(|e| e.state.clone()));
        Digest {
            from: self.local.member.id.clone(),
            members,
        }
    }

    fn members(&self) -> Vec<Member> {
        let mut members = vec![self.local.member.clone()];
        members.extend(self.peers.values().map(|e| e.state.member.clone()));
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    fn gossip_addr(&self, id: &str) -> Option<SocketAddr> {
        let state = &self.peers.get(id)?.state;
        format!("{}:{}", bracket(&state.member.address), state.gossip_port)
            .parse()
            .ok()
    }

    /// Folds a received digest in.  The sender's own address is taken
    /// from the datagram source rather than from what it advertises.
    fn apply(&mut self, digest: Digest, source: SocketAddr, now: Instant) {
        for mut state in digest.members {
            let id = state.member.id.clone();
            if id == self.local.member.id {
                continue;
            }
            if id == digest.from {
                state.member.address = source.ip().to_string();
            }
            if self
                .tombstones
                .get(&id)
                .is_some_and(|dead| state.version() <= dead.version)
            {
                continue;
            }
            match self.peers.get_mut(&id) {
                Some(entry) if entry.state.version() >= state.version() => {}
                Some(entry) if entry.state.incarnation < state.incarnation => {
                    info!("Member {} restarted", id);
                    entry.state = state;
                    entry.seen = now;
                }
                Some(entry) => {
                    entry.state = state;
                    entry.seen = now;
                }
                None => {
                    info!(
                        "Member {} joined at {}",
                        id,
                        state.member.base_url()
                    );
                    self.tombstones.remove(&id);
                    self.peers.insert(id, Entry { state, seen: now });
                }
            }
        }
    }

    fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let dead: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, e)| now.duration_since(e.seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            if let Some(entry) = self.peers.remove(id) {
                warn!("Member {} timed out", id);
                self.tombstones.insert(
                    id.clone(),
                    Tombstone {
                        version: entry.state.version(),
                        buried: now,
                    },
                );
            }
        }
        let keep = timeout * TOMBSTONE_FACTOR;
        self.tombstones
            .retain(|_, t| now.duration_since(t.buried) <= keep);
        dead
    }
}

fn incarnation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn bracket(address: &str) -> String {
    if address.contains(':') {
        format!("[{}]", address)
    } else {
        address.to_string()
    }
}

pub struct GossipMembership {
    socket: UdpSocket,
    table: Mutex<Table>,
    seeds: Mutex<Vec<SocketAddr>>,
    failure_timeout: Duration,
}

impl GossipMembership {
    /// Binds the gossip socket.  `local.address` is what peers are told
    /// until they learn the real one from packet sources.
    pub async fn bind(
        local: Member,
        bind_addr: SocketAddr,
        failure_timeout: Duration,
    ) -> Result<Arc<Self>, MembershipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_port = socket.local_addr()?.port();
        info!("Gossip membership for {} listening on {}", local.id, socket.local_addr()?);
        let table = Table::new(MemberState {
            member: local,
            gossip_port,
            incarnation: incarnation(),
            heartbeat: 0,
        });
        Ok(Arc::new(Self {
            socket,
            table: Mutex::new(table),
            seeds: Mutex::new(Vec::new()),
            failure_timeout,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MembershipError> {
        Ok(self.socket.local_addr()?)
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // A poisoned table is still structurally valid.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serves the gossip socket and ticks forever.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Gossip tick failed: {}", e);
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, source)) => self.receive(&buf[..len], source),
                    Err(e) => warn!("Gossip receive failed: {}", e),
                },
            }
        }
    }

    fn receive(&self, datagram: &[u8], source: SocketAddr) {
        match serde_json::from_slice::<Digest>(datagram) {
            Ok(digest) => {
                debug!("Digest from {} ({} members)", digest.from, digest.members.len());
                self.table().apply(digest, source, Instant::now());
            }
            Err(e) => warn!("Discarding malformed digest from {}: {}", source, e),
        }
    }

    async fn tick(&self) -> Result<(), MembershipError> {
        let (payload, targets) = {
            let mut table = self.table();
            table.local.heartbeat += 1;
            table.expire(Instant::now(), self.failure_timeout);

            let local_id = table.local.member.id.clone();
            let members = table.members();
            let mut ids: Vec<String> = buddies(&local_id, &members)
                .into_iter()
                .map(|m| m.id)
                .collect();
            let others: Vec<&Member> = members.iter().filter(|m| m.id != local_id).collect();
            if !others.is_empty() {
                let pick = &others[fastrand::usize(..others.len())].id;
                if !ids.contains(pick) {
                    ids.push(pick.clone());
                }
            }
            let mut targets: Vec<SocketAddr> =
                ids.iter().filter_map(|id| table.gossip_addr(id)).collect();
            if table.peers.is_empty() {
                targets.extend(self.seeds.lock().unwrap_or_else(|e| e.into_inner()).iter());
            }
            (serde_json::to_vec(&table.digest())?, targets)
        };

        for target in targets {
            if let Err(e) = self.socket.send_to(&payload, target).await {
                debug!("Gossip to {} failed: {}", target, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Membership for GossipMembership {
    /// Resolves `seed` (`host:port`) and sends it our table.  The seed is
    /// retried on every tick until some peer is known.
    async fn join(&self, seed: &str) -> Result<(), MembershipError> {
        let resolve_err = |message: String| MembershipError::Resolve {
            seed: seed.to_string(),
            message,
        };
        let addr = lookup_host(seed)
            .await
            .map_err(|e| resolve_err(e.to_string()))?
            .next()
            .ok_or_else(|| resolve_err("no addresses".to_string()))?;

        let payload = serde_json::to_vec(&self.table().digest())?;
        self.socket.send_to(&payload, addr).await?;
        self.seeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(addr);
        info!("Joining cluster through {} ({})", seed, addr);
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        self.table().members()
    }
}
