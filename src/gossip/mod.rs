//! Gossip subsystem: cluster membership and spec propagation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MembershipError;

pub mod membership;
pub mod propagate;

pub use membership::GossipMembership;
pub use propagate::Propagator;

/// A peer daemon as known through the membership view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub address: String,
    /// Control API port.
    pub port: u16,
}

impl Member {
    pub fn base_url(&self) -> String {
        if self.address.contains(':') {
            format!("http://[{}]:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }
}

/// Eventually-consistent view of the cluster.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn join(&self, seed: &str) -> Result<(), MembershipError>;

    /// Current members, self included.
    fn members(&self) -> Vec<Member>;
}

/// Picks at most two propagation targets for `local_id`.
///
/// Up to three members everyone talks to everyone.  Beyond that the
/// members are sorted by id into a ring and each node targets its two
/// immediate successors, so every node derives the same ring from the
/// same snapshot.  A node missing from its own view gets no targets.
pub fn buddies(local_id: &str, members: &[Member]) -> Vec<Member> {
    let mut sorted: Vec<&Member> = members.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.dedup_by(|a, b| a.id == b.id);

    let Some(index) = sorted.iter().position(|m| m.id == local_id) else {
        return Vec::new();
    };
    match sorted.len() {
        0 | 1 => Vec::new(),
        2 | 3 => sorted
            .into_iter()
            .filter(|m| m.id != local_id)
            .cloned()
            .collect(),
        n => {
            let ring: Vec<&Member> = sorted.iter().chain(sorted.iter()).copied().collect();
            assert!(
                index + 2 < ring.len(),
                "buddy ring of {} members has no successors for index {}",
                n,
                index
            );
            vec![ring[index + 1].clone(), ring[index + 2].clone()]
        }
    }
}
