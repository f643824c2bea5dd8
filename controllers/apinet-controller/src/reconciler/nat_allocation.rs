//! Port-block bookkeeping of a NAT gateway.
//!
//! Every gateway IP offers `slots_per_ip` blocks of `P` ports starting at
//! the first ephemeral port: block `b` covers
//! `[1024 + b * P, 1024 + (b + 1) * P - 1]`. Blocks are handed out IP by IP
//! in declared order, lowest block first.

use apinet_api::internal::{MIN_EPHEMERAL_PORT, slots_per_ip};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// One block of ports on a gateway IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortBlock {
    pub ip: IpAddr,
    pub port: i32,
    pub end_port: i32,
}

/// Tracks which blocks of a gateway are in use.
#[derive(Debug)]
pub struct AllocationManager {
    ports_per_interface: i32,
    slots: i64,
    ips: Vec<IpAddr>,
    /// (ip index, block index)
    used: BTreeSet<(usize, i64)>,
}

impl AllocationManager {
    /// Duplicate IPs are only counted once.
    pub fn new(ports_per_interface: i32, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut unique = Vec::new();
        for ip in ips {
            if !unique.contains(&ip) {
                unique.push(ip);
            }
        }
        Self {
            ports_per_interface,
            slots: slots_per_ip(ports_per_interface),
            ips: unique,
            used: BTreeSet::new(),
        }
    }

    /// Total number of blocks across all IPs.
    pub fn capacity(&self) -> i64 {
        self.slots * i64::try_from(self.ips.len()).unwrap_or(i64::MAX)
    }

    /// Number of blocks in use.
    pub fn used(&self) -> usize {
        self.used.len()
    }

    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    fn locate(&self, block: &PortBlock) -> Option<(usize, i64)> {
        let ip_idx = self.ips.iter().position(|ip| *ip == block.ip)?;
        let offset = block.port.checked_sub(MIN_EPHEMERAL_PORT)?;
        if self.ports_per_interface <= 0 || offset < 0 || offset % self.ports_per_interface != 0 {
            return None;
        }
        if block.end_port != block.port + self.ports_per_interface - 1 {
            return None;
        }
        let idx = i64::from(offset / self.ports_per_interface);
        (idx < self.slots).then_some((ip_idx, idx))
    }

    fn block(&self, ip_idx: usize, idx: i64) -> Option<PortBlock> {
        let ip = *self.ips.get(ip_idx)?;
        let port = MIN_EPHEMERAL_PORT + i32::try_from(idx).ok()? * self.ports_per_interface;
        Some(PortBlock {
            ip,
            port,
            end_port: port + self.ports_per_interface - 1,
        })
    }

    /// Marks an existing block as used. Returns false if the block does not
    /// belong to this gateway's layout or is already taken.
    pub fn mark_used(&mut self, block: &PortBlock) -> bool {
        match self.locate(block) {
            Some(slot) => self.used.insert(slot),
            None => false,
        }
    }

    /// Takes the first free block.
    pub fn use_next_free(&mut self) -> Option<PortBlock> {
        for ip_idx in 0..self.ips.len() {
            for idx in 0..self.slots {
                if !self.used.contains(&(ip_idx, idx)) {
                    self.used.insert((ip_idx, idx));
                    return self.block(ip_idx, idx);
                }
            }
        }
        None
    }

    /// Gives a block back.
    pub fn release(&mut self, block: &PortBlock) {
        if let Some(slot) = self.locate(block) {
            self.used.remove(&slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_blocks_are_handed_out_in_order() {
        let mut manager = AllocationManager::new(64, [ip("10.0.0.1"), ip("10.0.0.2")]);
        assert_eq!(manager.capacity(), 2 * 1008);

        let first = manager.use_next_free().unwrap();
        assert_eq!(first, PortBlock { ip: ip("10.0.0.1"), port: 1024, end_port: 1087 });
        let second = manager.use_next_free().unwrap();
        assert_eq!(second.port, 1088);
        assert_eq!(second.end_port, 1151);
        assert_eq!(manager.used(), 2);
    }

    #[test]
    fn test_spills_to_next_ip_when_full() {
        let mut manager = AllocationManager::new(64512, [ip("10.0.0.1"), ip("10.0.0.2")]);
        let first = manager.use_next_free().unwrap();
        assert_eq!(first, PortBlock { ip: ip("10.0.0.1"), port: 1024, end_port: 65535 });
        let second = manager.use_next_free().unwrap();
        assert_eq!(second.ip, ip("10.0.0.2"));
        assert_eq!(manager.use_next_free(), None);
    }

    #[test]
    fn test_mark_used_rejects_foreign_and_duplicate_blocks() {
        let mut manager = AllocationManager::new(64, [ip("10.0.0.1")]);
        let block = PortBlock { ip: ip("10.0.0.1"), port: 1088, end_port: 1151 };
        assert!(manager.mark_used(&block));
        assert!(!manager.mark_used(&block));

        assert!(!manager.mark_used(&PortBlock { ip: ip("10.0.0.9"), port: 1024, end_port: 1087 }));
        assert!(!manager.mark_used(&PortBlock { ip: ip("10.0.0.1"), port: 1030, end_port: 1093 }));
        assert!(!manager.mark_used(&PortBlock { ip: ip("10.0.0.1"), port: 1024, end_port: 2047 }));

        // The marked block is skipped, the one before it is still free.
        assert_eq!(manager.use_next_free().unwrap().port, 1024);
        assert_eq!(manager.use_next_free().unwrap().port, 1152);
    }

    #[test]
    fn test_release_frees_block() {
        let mut manager = AllocationManager::new(64512, [ip("10.0.0.1")]);
        let block = manager.use_next_free().unwrap();
        assert_eq!(manager.use_next_free(), None);
        manager.release(&block);
        assert_eq!(manager.use_next_free(), Some(block));
    }

    #[test]
    fn test_duplicate_ips_count_once() {
        let manager = AllocationManager::new(64512, [ip("10.0.0.1"), ip("10.0.0.1")]);
        assert_eq!(manager.capacity(), 1);
        assert_eq!(manager.ips().len(), 1);
    }
}
