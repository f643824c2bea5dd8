//! VNI allocator
//!
//! Each allocated VNI is materialised as a cluster-scoped `NetworkID` named
//! after the decimal VNI. Creating the leaf is the commit point: the store
//! rejects a second create for the same name, so two allocators racing for
//! the same VNI cannot both win.

use apinet_api::internal::{NetworkID, NetworkIDSpec};
use apinet_api::vni::{VniRange, encode_vni};
use apinet_api::ClaimRef;
use apinet_client::error::ignore_not_found;
use apinet_client::{ClientError, ListSelector, ResourceClient};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::AllocationError;

/// Allocates VNIs from a configured range.
#[derive(Clone)]
pub struct VniAllocator {
    client: Arc<dyn ResourceClient<NetworkID>>,
    range: VniRange,
}

impl std::fmt::Debug for VniAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VniAllocator").field("range", &self.range).finish_non_exhaustive()
    }
}

impl VniAllocator {
    pub fn new(client: Arc<dyn ResourceClient<NetworkID>>, range: VniRange) -> Self {
        Self { client, range }
    }

    pub fn range(&self) -> VniRange {
        self.range
    }

    /// Allocates `vni` for the claimer.
    ///
    /// Fails with `OutOfRange` if the VNI is outside the configured range
    /// and with `AlreadyAllocated` if another claimer holds it.
    pub async fn allocate(&self, claim_ref: &ClaimRef, vni: u32) -> Result<u32, AllocationError> {
        self.range.check(vni)?;
        match self.create(claim_ref, vni).await {
            Ok(()) => Ok(vni),
            Err(ClientError::AlreadyExists(_)) => {
                // Re-allocating our own VNI is a no-op.
                let existing = self.client.get(None, &encode_vni(vni)).await?;
                if existing.spec.claim_ref.uid == claim_ref.uid {
                    Ok(vni)
                } else {
                    Err(AllocationError::AlreadyAllocated(format!("VNI {vni}")))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocates any free VNI for the claimer.
    ///
    /// Starts at a uniformly random offset and sweeps the whole range once,
    /// wrapping around. Candidates already present in the listed snapshot
    /// are skipped without a write; the create is still authoritative.
    pub async fn allocate_next(&self, claim_ref: &ClaimRef) -> Result<u32, AllocationError> {
        let taken: HashSet<String> = self
            .client
            .list(None, &ListSelector::new())
            .await?
            .into_iter()
            .filter_map(|id| id.metadata.name)
            .collect();

        let size = self.range.size();
        if u64::try_from(taken.len()).unwrap_or(u64::MAX) >= u64::from(size) {
            return Err(AllocationError::PoolExhausted(format!(
                "all {size} VNIs in [{}, {}] are allocated",
                self.range.min(),
                self.range.max()
            )));
        }

        let start = rand::thread_rng().gen_range(0..size);
        for i in 0..size {
            let vni = self.range.nth_wrapping(start.wrapping_add(i) % size);
            if taken.contains(&encode_vni(vni)) {
                continue;
            }
            match self.create(claim_ref, vni).await {
                Ok(()) => return Ok(vni),
                Err(ClientError::AlreadyExists(_)) => {
                    debug!(vni, "VNI taken concurrently, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AllocationError::PoolExhausted(format!(
            "no free VNI in [{}, {}]",
            self.range.min(),
            self.range.max()
        )))
    }

    /// Releases `vni`. Releasing a VNI that is not allocated succeeds.
    pub async fn release(&self, vni: u32) -> Result<(), AllocationError> {
        ignore_not_found(self.client.delete(None, &encode_vni(vni)).await)?;
        info!(vni, "Released VNI");
        Ok(())
    }

    /// Sentinel returned for dry-run allocations; touches no state.
    pub fn dry_run(&self) -> u32 {
        self.range.min()
    }

    async fn create(&self, claim_ref: &ClaimRef, vni: u32) -> Result<(), ClientError> {
        let id = encode_vni(vni);
        let network_id = NetworkID::new(
            &id,
            NetworkIDSpec {
                id: id.clone(),
                claim_ref: claim_ref.clone(),
            },
        );
        self.client.create(None, &network_id).await?;
        info!(
            vni,
            claimer = %claim_ref.name,
            claimer_uid = %claim_ref.uid,
            "Allocated VNI"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apinet_client::MockClient;

    fn claim(name: &str, uid: &str) -> ClaimRef {
        ClaimRef {
            group: apinet_api::CORE_GROUP.to_string(),
            resource: "networks".to_string(),
            namespace: Some("apinet".to_string()),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    fn allocator(min: u32, max: u32) -> (VniAllocator, MockClient<NetworkID>) {
        let client = MockClient::<NetworkID>::new();
        let allocator = VniAllocator::new(Arc::new(client.clone()), VniRange::new(min, max).unwrap());
        (allocator, client)
    }

    #[tokio::test]
    async fn test_allocate_specific() {
        let (allocator, client) = allocator(200, 300);
        assert_eq!(allocator.allocate(&claim("a", "uid-a"), 250).await.unwrap(), 250);

        let leaf = client.object(None, "250").unwrap();
        assert_eq!(leaf.spec.claim_ref.uid, "uid-a");

        // Same claimer: idempotent.
        assert_eq!(allocator.allocate(&claim("a", "uid-a"), 250).await.unwrap(), 250);

        // Other claimer: collision.
        assert!(matches!(
            allocator.allocate(&claim("b", "uid-b"), 250).await,
            Err(AllocationError::AlreadyAllocated(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_out_of_range() {
        let (allocator, _) = allocator(200, 300);
        assert!(matches!(
            allocator.allocate(&claim("a", "uid-a"), 199).await,
            Err(AllocationError::OutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_next_sweeps_whole_range() {
        let (allocator, client) = allocator(200, 203);
        let mut seen = HashSet::new();
        for i in 0..4 {
            let vni = allocator
                .allocate_next(&claim(&format!("n{i}"), &format!("uid-{i}")))
                .await
                .unwrap();
            assert!((200..=203).contains(&vni));
            assert!(seen.insert(vni), "VNI {vni} allocated twice");
        }
        assert_eq!(client.len(), 4);

        assert!(matches!(
            allocator.allocate_next(&claim("n5", "uid-5")).await,
            Err(AllocationError::PoolExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (allocator, client) = allocator(200, 300);
        allocator.allocate(&claim("a", "uid-a"), 220).await.unwrap();
        allocator.release(220).await.unwrap();
        assert!(client.is_empty());
        allocator.release(220).await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let (allocator, client) = allocator(200, 300);
        assert_eq!(allocator.dry_run(), 200);
        assert!(client.is_empty());
    }
}
