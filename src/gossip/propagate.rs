//! Pushes this node's specs to its buddies.
//!
//! Only specs this node originated (origin empty or equal to the local
//! id) are sent, stamped with the local id.  Receivers therefore never
//! forward them again: a change travels at most one hop beyond the node
//! where it was made.

use std::sync::Arc;

use futures_util::future::join_all;
use log::{debug, warn};

use super::{buddies, Membership};
use crate::client::PeerClient;
use crate::types::ServiceSpec;

pub struct Propagator {
    local_id: String,
    membership: Arc<dyn Membership>,
    client: PeerClient,
}

impl Propagator {
    pub fn new(local_id: String, membership: Arc<dyn Membership>, client: PeerClient) -> Self {
        Self {
            local_id,
            membership,
            client,
        }
    }

    /// Specs this node may broadcast, stamped with its id.
    pub fn outgoing(&self, specs: Vec<ServiceSpec>) -> Vec<ServiceSpec> {
        specs
            .into_iter()
            .filter(|s| s.origin.as_deref().map_or(true, |o| o == self.local_id))
            .map(|mut s| {
                s.origin = Some(self.local_id.clone());
                s
            })
            .collect()
    }

    /// Sends `specs` to this round's buddies concurrently and returns how
    /// many accepted the request.  Failures are logged and skipped; the
    /// next cycle tries again.
    pub async fn propagate(&self, specs: Vec<ServiceSpec>) -> usize {
        let targets = buddies(&self.local_id, &self.membership.members());
        if targets.is_empty() {
            return 0;
        }
        let outgoing = self.outgoing(specs);
        if outgoing.is_empty() {
            return 0;
        }

        let calls = targets.iter().map(|member| {
            let base_url = member.base_url();
            let outgoing = &outgoing;
            async move {
                let result = self.client.put_services(&base_url, outgoing).await;
                (member, result)
            }
        });
        let mut reached = 0;
        for (member, result) in join_all(calls).await {
            match result {
                Ok(summary) => {
                    reached += 1;
                    if !summary.accepted.is_empty() {
                        debug!("{} accepted {:?}", member.id, summary.accepted);
                    }
                }
                Err(e) => warn!("Failed to propagate services to {}: {}", member.id, e),
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MembershipError;
    use crate::gossip::Member;
    use crate::types::tests::spec;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixed(Vec<Member>);

    #[async_trait]
    impl Membership for Fixed {
        async fn join(&self, _seed: &str) -> Result<(), MembershipError> {
            Ok(())
        }

        fn members(&self) -> Vec<Member> {
            self.0.clone()
        }
    }

    fn propagator(members: Vec<Member>) -> Propagator {
        let client = PeerClient::new(Duration::from_millis(200), None).unwrap();
        Propagator::new("a".into(), Arc::new(Fixed(members)), client)
    }

    #[test]
    fn outgoing_skips_specs_learned_from_peers() {
        let p = propagator(Vec::new());
        let local = spec("local", "corp/local", "1");
        let mut mine = spec("mine", "corp/mine", "1");
        mine.origin = Some("a".into());
        let mut learned = spec("learned", "corp/learned", "1");
        learned.origin = Some("b".into());

        let out = p.outgoing(vec![local, mine, learned]);
        let names: Vec<&str> = out.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["local", "mine"]);
        assert!(out.iter().all(|s| s.origin.as_deref() == Some("a")));
    }

    #[tokio::test]
    async fn single_node_propagates_nowhere() {
        let p = propagator(vec![crate::gossip::tests::member("a")]);
        assert_eq!(p.propagate(vec![spec("app", "corp/app", "1")]).await, 0);
    }

    #[tokio::test]
    async fn unreachable_buddies_are_skipped() {
        let mut dead = crate::gossip::tests::member("b");
        dead.port = 1;
        let p = propagator(vec![crate::gossip::tests::member("a"), dead]);
        assert_eq!(p.propagate(vec![spec("app", "corp/app", "1")]).await, 0);
    }
}
