//! KeyRing - one branch's public key and its derived addresses
//!
//! Addresses are appended in index order with no gaps, so `addresses[i].index == i`.

use super::address::{Address, ScriptType};
use super::extended::ExtendedKey;
use super::format::Branch;
use super::KeyError;
use crate::crypto::CurveBackend;
use crate::network::NetworkParams;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct KeyRing {
    branch: Branch,
    script_type: ScriptType,
    key: Option<ExtendedKey>,
    addresses: Vec<Address>,
    used: BTreeSet<u32>,
}

impl KeyRing {
    pub fn new(branch: Branch, script_type: ScriptType) -> Self {
        Self { branch, script_type, key: None, addresses: Vec::new(), used: BTreeSet::new() }
    }

    pub fn branch(&self) -> Branch { self.branch }
    pub fn script_type(&self) -> ScriptType { self.script_type }
    pub fn key(&self) -> Option<&ExtendedKey> { self.key.as_ref() }
    pub fn addresses(&self) -> &[Address] { &self.addresses }
    pub fn len(&self) -> usize { self.addresses.len() }
    pub fn is_empty(&self) -> bool { self.addresses.is_empty() }
    pub fn last(&self) -> Option<&Address> { self.addresses.last() }
    pub fn next_index(&self) -> u32 { self.addresses.len() as u32 }

    /// Store the branch key; only the public half is kept.
    pub fn set_key(&mut self, key: ExtendedKey, backend: &dyn CurveBackend) -> Result<(), KeyError> {
        self.key = Some(key.neuter(backend)?);
        Ok(())
    }

    pub fn highest_used(&self) -> Option<u32> { self.used.iter().next_back().copied() }

    pub fn is_used(&self, index: u32) -> bool { self.used.contains(&index) }

    pub fn set_used(&mut self, index: u32, used: bool) {
        if used {
            self.used.insert(index);
        } else {
            self.used.remove(&index);
        }
    }

    pub fn first_unused(&self) -> Option<&Address> {
        self.addresses.iter().find(|a| !self.used.contains(&a.index))
    }

    /// True while fewer than `gap_limit` addresses follow the highest used one.
    pub fn needs_fill(&self, gap_limit: u32) -> bool {
        let highest_used = self.highest_used().map(i64::from).unwrap_or(-1);
        let last_derived = self.addresses.len() as i64 - 1;
        last_derived - highest_used < i64::from(gap_limit)
    }

    pub fn derive_address(&self, backend: &dyn CurveBackend, network: &NetworkParams, index: u32) -> Result<Address, KeyError> {
        let key = self.key.as_ref().ok_or(KeyError::MissingMasterKey)?;
        let public = key.derive_child(backend, index)?.public_key(backend)?;
        Address::from_public_key(&public, self.script_type, network, self.branch, index)
    }

    /// Append the next address. Its index must be `len()` and its branch this ring's.
    pub fn push(&mut self, address: Address) -> Result<(), KeyError> {
        if address.index != self.next_index() {
            return Err(KeyError::IndexOutOfRange(u64::from(address.index)));
        }
        if address.branch != self.branch {
            return Err(KeyError::UnsupportedBranch(address.branch));
        }
        self.addresses.push(address);
        Ok(())
    }

    pub fn find(&self, script_hash: &str) -> Option<&Address> {
        self.addresses.iter().find(|a| a.script_hash == script_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(index: u32) -> Address {
        Address { display_address: format!("addr{}", index), script_hash: format!("sh{}", index), index, branch: Branch::Receive }
    }

    #[test]
    fn test_needs_fill() {
        let mut ring = KeyRing::new(Branch::Receive, ScriptType::P2pkh);
        assert!(ring.needs_fill(3));
        for i in 0..3 {
            ring.push(address(i)).unwrap();
        }
        assert!(!ring.needs_fill(3));
        ring.set_used(0, true);
        assert!(ring.needs_fill(3));
        assert_eq!(ring.first_unused().unwrap().index, 1);
    }

    #[test]
    fn test_push_rejects_gaps() {
        let mut ring = KeyRing::new(Branch::Receive, ScriptType::P2pkh);
        assert!(ring.push(address(1)).is_err());
        ring.push(address(0)).unwrap();
        let mut other = address(1);
        other.branch = Branch::Change;
        assert!(matches!(ring.push(other), Err(KeyError::UnsupportedBranch(Branch::Change))));
    }

    #[test]
    fn test_used_beyond_derived() {
        let mut ring = KeyRing::new(Branch::Receive, ScriptType::P2pkh);
        ring.set_used(25, true);
        assert_eq!(ring.highest_used(), Some(25));
        ring.set_used(25, false);
        assert_eq!(ring.highest_used(), None);
    }
}
