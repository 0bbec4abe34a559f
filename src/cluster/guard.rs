//! Inter-instance communication guard.
//!
//! Before a follower joins the fleet it must prove it can talk to the
//! recorded leader.  An instance that cannot reach the leader would accept
//! submissions it can never hand over, so failing here is fatal.

use std::future::Future;
use std::pin::Pin;

use tracing::{error, info};

use super::client::PeerClient;
use crate::errors::ShieldError;

/// Something that can check connectivity to a peer.
pub trait LeaderProbe: Send + Sync + 'static {
    fn probe(&self, leader: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

impl LeaderProbe for PeerClient {
    fn probe(&self, leader: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let leader = leader.to_string();
        Box::pin(async move { self.ping(&leader).await })
    }
}

/// Verify `leader` answers an authenticated no-op request.
pub async fn verify_leader_reachable(
    probe: &dyn LeaderProbe,
    leader: &str,
) -> Result<(), ShieldError> {
    match probe.probe(leader).await {
        Ok(()) => {
            info!(leader, "Verified connectivity to current leader");
            Ok(())
        }
        Err(e) => {
            error!(leader, error = %e, "Cannot reach current leader; refusing to join the fleet");
            Err(ShieldError::LeaderUnreachable {
                leader: leader.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(bool);

    impl LeaderProbe for FixedProbe {
        fn probe(
            &self,
            _leader: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let ok = self.0;
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("connection refused"))
                }
            })
        }
    }

    #[tokio::test]
    async fn test_reachable_leader_passes() {
        verify_leader_reachable(&FixedProbe(true), "a:1").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_leader_is_fatal() {
        let err = verify_leader_reachable(&FixedProbe(false), "a:1")
            .await
            .unwrap_err();
        match err {
            ShieldError::LeaderUnreachable { leader, reason } => {
                assert_eq!(leader, "a:1");
                assert!(reason.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
