//! Host-key verification policies for [`super::Executor`].

use async_trait::async_trait;
use dashmap::DashMap;
use russh::keys::key::PublicKey;
use std::collections::HashMap;

#[async_trait]
pub trait HostKeyPolicy: Send + Sync {
    /// Return `true` if the presented key should be accepted for `machine_id`.
    async fn check(&self, machine_id: &str, key: &PublicKey) -> bool;
}

/// Accept a host key the first time it is seen for a machine, then pin it.
/// This is the default policy — matching spec.md §4.1's "default accepts on
/// first encounter and pins thereafter".
#[derive(Default)]
pub struct AcceptNewPolicy {
    pinned: DashMap<String, Vec<u8>>,
}

#[async_trait]
impl HostKeyPolicy for AcceptNewPolicy {
    async fn check(&self, machine_id: &str, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint().into_bytes();
        match self.pinned.get(machine_id) {
            Some(pinned) => *pinned == fingerprint,
            None => {
                self.pinned.insert(machine_id.to_string(), fingerprint);
                true
            }
        }
    }
}

/// Only accept keys pre-provisioned by an operator.
pub struct StrictPolicy {
    known_hosts: HashMap<String, Vec<u8>>,
}

impl StrictPolicy {
    pub fn new(known_hosts: HashMap<String, Vec<u8>>) -> Self {
        Self { known_hosts }
    }
}

#[async_trait]
impl HostKeyPolicy for StrictPolicy {
    async fn check(&self, machine_id: &str, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint().into_bytes();
        self.known_hosts
            .get(machine_id)
            .is_some_and(|expected| *expected == fingerprint)
    }
}
