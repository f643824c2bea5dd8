//! Allocators facade
//!
//! Objects requesting public IPs (load balancers, network interfaces, NAT
//! gateways) go through [`Allocators`], which turns their requests into IP
//! records plus `IPAddress` leaves and hands back a [`Transaction`]:
//!
//! - `revert()` releases everything the transaction allocated
//! - `commit()` releases what the allocation superseded
//!
//! Requests are processed per IP family, IPv4 first.

use apinet_api::IPFamily;
use apinet_api::internal::{IP, LoadBalancer, NATGateway, NetworkInterface, PublicIPRequest};
use std::net::IpAddr;
use tracing::{debug, warn};

use apinet_client::ResourceObject;

use crate::error::AllocationError;
use crate::ip::{IPAllocator, IPClaimer, address_claim_ref, is_controlled_by, is_ephemeral};
use crate::ipaddress::IPAddressAllocator;

/// An object that requests public IPs.
pub trait IPRequester: ResourceObject {
    fn ip_requests(&self) -> Vec<PublicIPRequest>;
}

impl IPRequester for LoadBalancer {
    fn ip_requests(&self) -> Vec<PublicIPRequest> {
        self.spec.ips.clone()
    }
}

impl IPRequester for NetworkInterface {
    fn ip_requests(&self) -> Vec<PublicIPRequest> {
        self.spec.public_ips.clone()
    }
}

impl IPRequester for NATGateway {
    fn ip_requests(&self) -> Vec<PublicIPRequest> {
        self.spec
            .ips
            .iter()
            .map(|ip| PublicIPRequest {
                name: ip.name.clone(),
                ip_family: self.spec.ip_family,
                ip: ip.ip,
                ip_ref: None,
            })
            .collect()
    }
}

/// Runs the per-namespace IP allocator and the public-prefix allocator
/// together.
#[derive(Debug, Clone)]
pub struct Allocators {
    ips: IPAllocator,
    addresses: IPAddressAllocator,
}

/// Outcome of an allocation that can still be undone.
#[derive(Debug)]
#[must_use = "a transaction must be committed or reverted"]
pub struct Transaction<'a> {
    allocators: &'a Allocators,
    claimer: IPClaimer,
    allocated: Vec<IP>,
    superseded: Vec<IP>,
}

impl Transaction<'_> {
    /// IPs newly allocated by this transaction.
    pub fn allocated(&self) -> &[IP] {
        &self.allocated
    }

    /// IPs the claimer held before and no longer requests.
    pub fn superseded(&self) -> &[IP] {
        &self.superseded
    }

    /// Keeps the new allocations and releases the superseded ones.
    pub async fn commit(self) -> Result<(), AllocationError> {
        for ip in &self.superseded {
            self.allocators.release_ip(&self.claimer, ip).await?;
        }
        Ok(())
    }

    /// Releases everything this transaction allocated.
    pub async fn revert(self) -> Result<(), AllocationError> {
        for ip in &self.allocated {
            self.allocators.release_ip(&self.claimer, ip).await?;
        }
        Ok(())
    }
}

fn claimer_of<O: IPRequester>(obj: &O) -> Result<IPClaimer, AllocationError> {
    IPClaimer::from_object(obj).ok_or_else(|| {
        AllocationError::InvalidRange(format!(
            "{} has no namespace, name or uid",
            O::kind(&())
        ))
    })
}

/// Requests grouped by family, keeping their original positions.
fn by_family(requests: &[PublicIPRequest]) -> Vec<(usize, &PublicIPRequest)> {
    let mut ordered: Vec<_> = requests.iter().enumerate().collect();
    ordered.sort_by_key(|(idx, req)| (req.ip_family, *idx));
    ordered
}

impl Allocators {
    pub fn new(ips: IPAllocator, addresses: IPAddressAllocator) -> Self {
        Self { ips, addresses }
    }

    pub fn ips(&self) -> &IPAllocator {
        &self.ips
    }

    pub fn addresses(&self) -> &IPAddressAllocator {
        &self.addresses
    }

    /// Allocates every request of a new object.
    ///
    /// Returns the requests with their addresses filled in.
    pub async fn allocate_create<O: IPRequester>(
        &self,
        obj: &O,
    ) -> Result<(Vec<PublicIPRequest>, Transaction<'_>), AllocationError> {
        let claimer = claimer_of(obj)?;
        let mut resolved = obj.ip_requests();
        let mut tx = Transaction {
            allocators: self,
            claimer,
            allocated: Vec::new(),
            superseded: Vec::new(),
        };

        let requests = resolved.clone();
        for (idx, request) in by_family(&requests) {
            match self.allocate_request(&tx.claimer, request).await {
                Ok(ip) => {
                    resolved[idx].ip = ip.spec.ip;
                    tx.allocated.push(ip);
                }
                Err(e) => {
                    if let Err(revert_err) = tx.revert().await {
                        warn!(error = %revert_err, "Failed to revert partial allocation");
                    }
                    return Err(e);
                }
            }
        }
        Ok((resolved, tx))
    }

    /// Allocates only what changed since the claimer's last allocation.
    ///
    /// IPs the claimer already holds are matched to requests by reference
    /// name or by address. Requests without an address always get a fresh
    /// one; held IPs matching no request are superseded.
    pub async fn allocate_update<O: IPRequester>(
        &self,
        obj: &O,
    ) -> Result<(Vec<PublicIPRequest>, Transaction<'_>), AllocationError> {
        let claimer = claimer_of(obj)?;
        let mut held = self.ips.claimed_by(&claimer).await?;
        let mut resolved = obj.ip_requests();
        let mut kept = Vec::new();
        let mut pending = Vec::new();

        let requests = resolved.clone();
        for (idx, request) in by_family(&requests) {
            let position = held.iter().position(|ip| matches_request(ip, request));
            match position {
                Some(pos) => {
                    let ip = held.swap_remove(pos);
                    resolved[idx].ip = ip.spec.ip;
                    kept.push(ip);
                }
                None => pending.push((idx, request)),
            }
        }

        let mut tx = Transaction {
            allocators: self,
            claimer,
            allocated: Vec::new(),
            superseded: held,
        };
        for (idx, request) in pending {
            match self.allocate_request(&tx.claimer, request).await {
                Ok(ip) => {
                    resolved[idx].ip = ip.spec.ip;
                    tx.allocated.push(ip);
                }
                Err(e) => {
                    tx.superseded.clear();
                    if let Err(revert_err) = tx.revert().await {
                        warn!(error = %revert_err, "Failed to revert partial allocation");
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            claimer = %tx.claimer.name,
            kept = kept.len(),
            allocated = tx.allocated.len(),
            superseded = tx.superseded.len(),
            "Computed IP allocation update"
        );
        Ok((resolved, tx))
    }

    /// Releases every IP the object holds.
    pub async fn release<O: IPRequester>(&self, obj: &O) -> Result<(), AllocationError> {
        let claimer = claimer_of(obj)?;
        for ip in self.ips.claimed_by(&claimer).await? {
            self.release_ip(&claimer, &ip).await?;
        }
        Ok(())
    }

    async fn allocate_request(&self, claimer: &IPClaimer, request: &PublicIPRequest) -> Result<IP, AllocationError> {
        if let Some(ip_ref) = &request.ip_ref {
            return self.ips.reserve(claimer, &ip_ref.name).await;
        }
        self.allocate_ephemeral(claimer, request.ip_family, request.ip).await
    }

    /// Creates an ephemeral IP and backs it with an `IPAddress` leaf.
    async fn allocate_ephemeral(
        &self,
        claimer: &IPClaimer,
        family: IPFamily,
        address: Option<IpAddr>,
    ) -> Result<IP, AllocationError> {
        let ip = self.ips.create_ephemeral(claimer, family, None).await?;
        let Some(claim_ref) = address_claim_ref(&ip) else {
            self.ips.delete(&ip).await?;
            return Err(AllocationError::InvalidRange("created IP has no name or uid".to_string()));
        };

        let allocated = match address {
            Some(address) => self.addresses.allocate(&claim_ref, address).await,
            None => self.addresses.allocate_next(&claim_ref, family).await,
        };
        let address = match allocated {
            Ok(address) => address,
            Err(e) => {
                self.ips.delete(&ip).await?;
                return Err(e);
            }
        };

        match self.ips.set_address(&ip, address).await {
            Ok(ip) => Ok(ip),
            Err(e) => {
                self.addresses.release_claimed(&address, &claim_ref.uid).await?;
                self.ips.delete(&ip).await?;
                Err(e)
            }
        }
    }

    /// Releases a single IP from the claimer, including the address leaf of
    /// ephemeral IPs.
    async fn release_ip(&self, claimer: &IPClaimer, ip: &IP) -> Result<(), AllocationError> {
        let controlled = is_controlled_by(ip, &claimer.uid);
        self.ips.release(claimer, ip).await?;
        if controlled {
            if let (Some(address), Some(uid)) = (ip.spec.ip, ip.metadata.uid.as_deref()) {
                self.addresses.release_claimed(&address, uid).await?;
            }
        }
        Ok(())
    }
}

/// Whether a held IP satisfies a request.
fn matches_request(ip: &IP, request: &PublicIPRequest) -> bool {
    if ip.spec.ip_family != request.ip_family {
        return false;
    }
    match (&request.ip_ref, request.ip) {
        (Some(ip_ref), _) => ip.metadata.name.as_deref() == Some(ip_ref.name.as_str()),
        (None, Some(address)) => ip.spec.ip == Some(address) && is_ephemeral(ip),
        (None, None) => false,
    }
}
