//! Public-prefix address allocator
//!
//! Each allocated address is materialised as a cluster-scoped `IPAddress`
//! leaf named after the address. At most one prefix per IP family is
//! configured.

use apinet_api::internal::{IPAddress, IPAddressSpec};
use apinet_api::labels::ip_address_name;
use apinet_api::{ClaimRef, IPFamily};
use apinet_client::error::ignore_not_found;
use apinet_client::{ClientError, ListSelector, ResourceClient};
use ipnet::IpNet;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::AllocationError;

/// Allocates addresses from the configured public prefixes.
#[derive(Clone)]
pub struct IPAddressAllocator {
    client: Arc<dyn ResourceClient<IPAddress>>,
    prefixes: Vec<IpNet>,
}

impl std::fmt::Debug for IPAddressAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IPAddressAllocator")
            .field("prefixes", &self.prefixes)
            .finish_non_exhaustive()
    }
}

/// Number of addresses in `prefix`, saturated at `i64::MAX`.
pub fn pool_size(prefix: &IpNet) -> u64 {
    let host_bits = u32::from(prefix.max_prefix_len() - prefix.prefix_len());
    if host_bits >= 63 {
        i64::MAX.unsigned_abs()
    } else {
        1u64 << host_bits
    }
}

/// Address at `offset` from the start of `prefix`.
pub fn nth_address(prefix: &IpNet, offset: u64) -> Option<IpAddr> {
    match prefix {
        IpNet::V4(net) => {
            let base = u64::from(u32::from(net.network()));
            let addr = u32::try_from(base.checked_add(offset)?).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(addr)))
        }
        IpNet::V6(net) => {
            let base = u128::from(net.network());
            let addr = base.checked_add(u128::from(offset))?;
            Some(IpAddr::V6(Ipv6Addr::from(addr)))
        }
    }
}

fn family_of_prefix(prefix: &IpNet) -> IPFamily {
    match prefix {
        IpNet::V4(_) => IPFamily::IPv4,
        IpNet::V6(_) => IPFamily::IPv6,
    }
}

impl IPAddressAllocator {
    /// Builds an allocator; at most one prefix per family is accepted.
    pub fn new(client: Arc<dyn ResourceClient<IPAddress>>, prefixes: Vec<IpNet>) -> Result<Self, AllocationError> {
        let mut families = HashSet::new();
        for prefix in &prefixes {
            if !families.insert(family_of_prefix(prefix)) {
                return Err(AllocationError::InvalidRange(format!(
                    "more than one {} public prefix configured",
                    family_of_prefix(prefix)
                )));
            }
        }
        Ok(Self { client, prefixes })
    }

    pub fn prefixes(&self) -> &[IpNet] {
        &self.prefixes
    }

    fn prefix_of_family(&self, family: IPFamily) -> Option<&IpNet> {
        self.prefixes.iter().find(|p| family_of_prefix(p) == family)
    }

    /// Whether `ip` lies inside a configured prefix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.prefixes.iter().any(|p| p.contains(ip))
    }

    /// Allocates `ip` for the claimer.
    ///
    /// Idempotent when the leaf already belongs to the same claimer uid.
    pub async fn allocate(&self, claim_ref: &ClaimRef, ip: IpAddr) -> Result<IpAddr, AllocationError> {
        if !self.contains(&ip) {
            return Err(AllocationError::OutOfRange(format!(
                "IP {ip} is not in any public prefix"
            )));
        }
        match self.create(claim_ref, ip).await {
            Ok(()) => Ok(ip),
            Err(ClientError::AlreadyExists(_)) => {
                let existing = self.client.get(None, &ip_address_name(&ip)).await?;
                if existing.spec.claim_ref.uid == claim_ref.uid {
                    Ok(ip)
                } else {
                    Err(AllocationError::AlreadyAllocated(format!("IP {ip}")))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocates any free address of `family` for the claimer.
    pub async fn allocate_next(&self, claim_ref: &ClaimRef, family: IPFamily) -> Result<IpAddr, AllocationError> {
        let Some(prefix) = self.prefix_of_family(family) else {
            return Err(AllocationError::PoolExhausted(format!(
                "no {family} public prefix configured"
            )));
        };

        let taken: HashSet<String> = self
            .client
            .list(None, &ListSelector::new())
            .await?
            .into_iter()
            .filter_map(|addr| addr.metadata.name)
            .collect();

        let size = pool_size(prefix);
        let start = rand::thread_rng().gen_range(0..size);
        for i in 0..size {
            let Some(ip) = nth_address(prefix, (start + i) % size) else {
                continue;
            };
            if taken.contains(&ip_address_name(&ip)) {
                continue;
            }
            match self.create(claim_ref, ip).await {
                Ok(()) => return Ok(ip),
                Err(ClientError::AlreadyExists(_)) => {
                    debug!(%ip, "IP taken concurrently, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AllocationError::PoolExhausted(format!("no free address in {prefix}")))
    }

    /// Releases `ip`. Releasing an address that is not allocated succeeds.
    pub async fn release(&self, ip: &IpAddr) -> Result<(), AllocationError> {
        ignore_not_found(self.client.delete(None, &ip_address_name(ip)).await)?;
        info!(%ip, "Released IP address");
        Ok(())
    }

    /// Releases `ip` only if it is still held by `uid`.
    pub async fn release_claimed(&self, ip: &IpAddr, uid: &str) -> Result<(), AllocationError> {
        match self.client.get_opt(None, &ip_address_name(ip)).await? {
            Some(existing) if existing.spec.claim_ref.uid == uid => self.release(ip).await,
            _ => Ok(()),
        }
    }

    async fn create(&self, claim_ref: &ClaimRef, ip: IpAddr) -> Result<(), ClientError> {
        let address = IPAddress::new(
            &ip_address_name(&ip),
            IPAddressSpec {
                ip,
                claim_ref: claim_ref.clone(),
            },
        );
        self.client.create(None, &address).await?;
        info!(
            %ip,
            claimer = %claim_ref.name,
            claimer_uid = %claim_ref.uid,
            "Allocated IP address"
        );
        Ok(())
    }
}
