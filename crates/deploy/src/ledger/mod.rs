//! Deployment ledger.
//!
//! The ledger maps each module kind to its last known proxy address, logic version and
//! applied settings. It is the recovery point after any crash: every mutation is persisted
//! through a [`LedgerStore`] before it becomes visible in memory, and a failed persist
//! leaves the previous state untouched.
//!
//! [`Ledger`] is a cheap handle (`Clone`) over shared state so several plans can run
//! against one ledger. Writers of the same kind are serialized through [`Ledger::claim`].

mod store;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use alloy_core::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{FileLedgerStore, LedgerStore, MemoryLedgerStore};

use crate::{DeployError, ModuleKind, Registry, TxHash};

/// Persisted state of one module kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    /// Proxy address; `None` while undeployed.
    pub address: Option<Address>,
    /// Logic version the proxy currently points at. Empty while undeployed.
    #[serde(default)]
    pub logic_version: String,
    /// Time of the last confirmed action on this module.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Setter signature -> fingerprint of the last confirmed value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applied: BTreeMap<String, String>,
    /// A deployment or upgrade whose outcome was never observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingOperation>,
}

impl DeploymentRecord {
    pub fn is_deployed(&self) -> bool {
        self.address.is_some()
    }
}

/// Irreversible operation left behind by an unconfirmed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "lowercase")]
pub enum PendingAction {
    Deploy,
    Upgrade,
}

/// A submitted Deploy or Upgrade that may or may not have landed.
///
/// While a record carries one, planning refuses the kind: retrying blindly could create a
/// second proxy or upgrade twice. [`Ledger::reconcile`] clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub action: PendingAction,
    /// Logic version the operation moves the module to.
    pub version: String,
    /// `None` when the submission itself was never acknowledged.
    pub tx_hash: Option<TxHash>,
    /// Proxy address the operation targets, when known.
    pub address: Option<Address>,
    pub submitted_at: DateTime<Utc>,
}

impl std::fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.action, self.version)?;
        if let Some(address) = self.address {
            write!(f, " at {address}")?;
        }
        match self.tx_hash {
            Some(tx_hash) => write!(f, " (tx {tx_hash})"),
            None => f.write_str(" (tx unknown)"),
        }
    }
}

/// What the operator found on chain for a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The transaction landed. `address` overrides the recorded proxy address, and is
    /// required for a deployment whose address was never learned.
    Landed { address: Option<Address> },
    /// The transaction never landed; the module stays as the ledger last recorded it.
    Dropped,
}

/// Persisted form of the whole ledger: module kind name -> record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerSnapshot(pub BTreeMap<ModuleKind, DeploymentRecord>);

impl LedgerSnapshot {
    pub fn get(&self, kind: &ModuleKind) -> Option<&DeploymentRecord> {
        self.0.get(kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModuleKind, &DeploymentRecord)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct LedgerState {
    records: BTreeMap<ModuleKind, DeploymentRecord>,
    store: Box<dyn LedgerStore>,
}

/// Shared handle to the deployment ledger.
#[derive(Clone)]
pub struct Ledger {
    state: Arc<Mutex<LedgerState>>,
    claims: Arc<Mutex<HashSet<ModuleKind>>>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open a ledger on top of a store, restoring whatever the store holds.
    pub fn open(store: impl LedgerStore) -> Result<Self, DeployError> {
        let records = store.load()?.map(|s| s.0).unwrap_or_default();
        tracing::debug!(entries = records.len(), "Ledger opened");
        Ok(Self {
            state: Arc::new(Mutex::new(LedgerState {
                records,
                store: Box::new(store),
            })),
            claims: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// A ledger backed by a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                records: BTreeMap::new(),
                store: Box::new(MemoryLedgerStore::default()),
            })),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, DeployError> {
        self.state.lock().map_err(|_| DeployError::LedgerPoisoned)
    }

    /// Apply `f` to a copy of the records, persist the copy, then adopt it.
    fn mutate<F>(&self, f: F) -> Result<(), DeployError>
    where
        F: FnOnce(&mut BTreeMap<ModuleKind, DeploymentRecord>) -> Result<(), DeployError>,
    {
        let mut state = self.lock()?;
        let mut next = state.records.clone();
        f(&mut next)?;

        let snapshot = LedgerSnapshot(next);
        state.store.persist(&snapshot)?;
        state.records = snapshot.0;
        Ok(())
    }

    /// The record of a kind, if the ledger has an entry for it.
    pub fn get(&self, kind: &ModuleKind) -> Result<Option<DeploymentRecord>, DeployError> {
        Ok(self.lock()?.records.get(kind).cloned())
    }

    /// The proxy address of a kind, if deployed.
    pub fn address_of(&self, kind: &ModuleKind) -> Result<Option<Address>, DeployError> {
        Ok(self.lock()?.records.get(kind).and_then(|r| r.address))
    }

    /// Seed an undeployed entry for every registered kind that has none yet.
    pub fn ensure_entries(&self, registry: &Registry) -> Result<(), DeployError> {
        let missing: Vec<ModuleKind> = {
            let state = self.lock()?;
            registry
                .kinds()
                .filter(|kind| !state.records.contains_key(*kind))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        tracing::debug!(?missing, "Seeding undeployed ledger entries");
        self.mutate(|records| {
            for kind in missing {
                records.entry(kind).or_default();
            }
            Ok(())
        })
    }

    /// Record a confirmed proxy creation.
    ///
    /// A kind's address never changes once assigned: recording a different address for an
    /// already deployed kind is a `LedgerConflict`.
    pub fn record_deployed(
        &self,
        kind: &ModuleKind,
        address: Address,
        version: &str,
    ) -> Result<(), DeployError> {
        self.mutate(|records| {
            let record = records.entry(kind.clone()).or_default();
            if let Some(existing) = record.address {
                if existing != address {
                    return Err(DeployError::LedgerConflict {
                        kind: kind.clone(),
                        reason: format!("already deployed at {existing}, refusing {address}"),
                    });
                }
            }
            *record = DeploymentRecord {
                address: Some(address),
                logic_version: version.to_string(),
                last_updated: Some(Utc::now()),
                applied: BTreeMap::new(),
                pending: None,
            };
            Ok(())
        })?;

        tracing::info!(kind = %kind, address = %address, version, "Ledger: deployment recorded");
        Ok(())
    }

    /// Record a confirmed logic upgrade. The proxy address is unchanged.
    pub fn record_upgraded(&self, kind: &ModuleKind, version: &str) -> Result<(), DeployError> {
        self.mutate(|records| {
            let record = records
                .get_mut(kind)
                .filter(|r| r.is_deployed())
                .ok_or_else(|| DeployError::LedgerConflict {
                    kind: kind.clone(),
                    reason: "cannot record an upgrade of an undeployed module".to_string(),
                })?;
            record.logic_version = version.to_string();
            record.last_updated = Some(Utc::now());
            record.pending = None;
            Ok(())
        })?;

        tracing::info!(kind = %kind, version, "Ledger: upgrade recorded");
        Ok(())
    }

    /// Record a confirmed Wire/Configure call.
    pub fn record_applied(
        &self,
        kind: &ModuleKind,
        setter: &str,
        fingerprint: &str,
    ) -> Result<(), DeployError> {
        self.mutate(|records| {
            let record = records
                .get_mut(kind)
                .filter(|r| r.is_deployed())
                .ok_or_else(|| DeployError::LedgerConflict {
                    kind: kind.clone(),
                    reason: format!("cannot record {setter} on an undeployed module"),
                })?;
            record
                .applied
                .insert(setter.to_string(), fingerprint.to_string());
            record.last_updated = Some(Utc::now());
            Ok(())
        })?;

        tracing::debug!(kind = %kind, setter, "Ledger: setting recorded");
        Ok(())
    }

    /// Mark a Deploy or Upgrade of `kind` whose outcome is unknown.
    pub fn record_pending(
        &self,
        kind: &ModuleKind,
        pending: PendingOperation,
    ) -> Result<(), DeployError> {
        let operation = pending.to_string();
        self.mutate(|records| {
            records.entry(kind.clone()).or_default().pending = Some(pending);
            Ok(())
        })?;

        tracing::warn!(kind = %kind, %operation, "Ledger: operation pending reconciliation");
        Ok(())
    }

    /// Settle the pending operation of `kind` with what was observed on chain.
    ///
    /// A landed deployment records the proxy address and version, a landed upgrade records
    /// the version, and a dropped one only clears the marker. Returns the updated record.
    pub fn reconcile(
        &self,
        kind: &ModuleKind,
        resolution: Resolution,
    ) -> Result<DeploymentRecord, DeployError> {
        let conflict = |reason: String| DeployError::LedgerConflict {
            kind: kind.clone(),
            reason,
        };

        let mut updated = DeploymentRecord::default();
        self.mutate(|records| {
            let record = records.entry(kind.clone()).or_default();
            let pending = record
                .pending
                .take()
                .ok_or_else(|| conflict("no pending operation to reconcile".to_string()))?;

            if let Resolution::Landed { address } = resolution {
                let address = address.or(pending.address).ok_or_else(|| {
                    conflict(format!(
                        "the address of the pending {} is unknown and must be given",
                        pending.action
                    ))
                })?;
                match (pending.action, record.address) {
                    (_, Some(existing)) if existing != address => {
                        return Err(conflict(format!(
                            "recorded at {existing}, refusing {address}"
                        )));
                    }
                    (PendingAction::Upgrade, None) => {
                        return Err(conflict(
                            "cannot settle an upgrade of an undeployed module".to_string(),
                        ));
                    }
                    (PendingAction::Deploy, _) => record.applied.clear(),
                    (PendingAction::Upgrade, _) => {}
                }
                record.address = Some(address);
                record.logic_version = pending.version;
                record.last_updated = Some(Utc::now());
            }
            updated = record.clone();
            Ok(())
        })?;

        tracing::info!(kind = %kind, ?resolution, "Ledger: pending operation reconciled");
        Ok(updated)
    }

    /// A copy of the full ledger in its persisted form.
    pub fn snapshot(&self) -> Result<LedgerSnapshot, DeployError> {
        Ok(LedgerSnapshot(self.lock()?.records.clone()))
    }

    /// Replace the ledger content with `snapshot` and persist it.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<(), DeployError> {
        self.mutate(|records| {
            *records = snapshot.0;
            Ok(())
        })?;
        tracing::info!("Ledger restored from snapshot");
        Ok(())
    }

    /// Claim exclusive write access to `kinds` for the lifetime of the returned guard.
    ///
    /// Fails with `KindBusy` (claiming nothing) if any kind is already claimed.
    pub fn claim(
        &self,
        kinds: impl IntoIterator<Item = ModuleKind>,
    ) -> Result<LedgerClaim, DeployError> {
        let kinds: BTreeSet<ModuleKind> = kinds.into_iter().collect();
        let mut claims = self.claims.lock().map_err(|_| DeployError::LedgerPoisoned)?;

        if let Some(busy) = kinds.iter().find(|kind| claims.contains(*kind)) {
            return Err(DeployError::KindBusy(busy.clone()));
        }
        claims.extend(kinds.iter().cloned());

        Ok(LedgerClaim {
            kinds,
            claims: Arc::clone(&self.claims),
        })
    }
}

/// Exclusive claim over a set of module kinds; released on drop.
#[derive(Debug)]
pub struct LedgerClaim {
    kinds: BTreeSet<ModuleKind>,
    claims: Arc<Mutex<HashSet<ModuleKind>>>,
}

impl LedgerClaim {
    pub fn kinds(&self) -> impl Iterator<Item = &ModuleKind> {
        self.kinds.iter()
    }
}

impl Drop for LedgerClaim {
    fn drop(&mut self) {
        // Release even if another holder panicked.
        let mut claims = match self.claims.lock() {
            Ok(claims) => claims,
            Err(poisoned) => poisoned.into_inner(),
        };
        for kind in &self.kinds {
            claims.remove(kind);
        }
    }
}
