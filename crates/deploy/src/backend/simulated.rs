//! Deterministic in-memory chain.
//!
//! Used by `apply --dry-run` and by tests. Addresses are derived from the deployer address
//! and a nonce exactly as a `CREATE` would, every submission is journaled, and faults can be
//! injected to exercise the failure paths of the orchestrator.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use alloy_core::primitives::{Address, keccak256};

use super::{BackendError, Confirmation, ExecutionBackend, LogicRef, ProxyDeployment};
use crate::{ArgValue, MethodSignature, ModuleKind, TxHash};

/// A failure to inject into the next matching submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the next proxy creation of `kind`.
    RejectCreate { kind: ModuleKind },
    /// Refuse the next upgrade of `kind`.
    RejectUpgrade { kind: ModuleKind },
    /// Mine but revert the next `times` calls of `method` (name or full signature).
    RevertCall { method: String, times: usize },
    /// Apply the next transaction touching `kind` but never report its receipt.
    WithholdConfirmation { kind: ModuleKind },
}

/// What a journaled transaction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmittedAction {
    CreateProxy {
        kind: ModuleKind,
        address: Address,
        logic: LogicRef,
        args: Vec<ArgValue>,
    },
    UpgradeProxy {
        kind: ModuleKind,
        address: Address,
        logic: LogicRef,
    },
    Call {
        kind: ModuleKind,
        address: Address,
        method: MethodSignature,
        args: Vec<ArgValue>,
    },
}

/// One transaction accepted by the simulated chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: TxHash,
    pub action: SubmittedAction,
    pub reverted: bool,
}

/// State of a proxy on the simulated chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedProxy {
    pub kind: ModuleKind,
    pub logic: LogicRef,
    pub init_args: Vec<ArgValue>,
    /// Last value written through each setter signature.
    pub settings: BTreeMap<String, Vec<ArgValue>>,
}

#[derive(Debug, Default)]
struct Chain {
    nonce: u64,
    proxies: HashMap<Address, SimulatedProxy>,
    receipts: HashMap<TxHash, Confirmation>,
    withheld: HashSet<TxHash>,
    faults: Vec<Fault>,
    journal: Vec<Submission>,
}

/// An [`ExecutionBackend`] that never leaves the process.
#[derive(Debug)]
pub struct SimulatedBackend {
    deployer: Address,
    chain: Mutex<Chain>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(Address::repeat_byte(0xde))
    }
}

impl SimulatedBackend {
    /// A fresh chain on which `deployer` sends every transaction.
    pub fn new(deployer: Address) -> Self {
        Self {
            deployer,
            chain: Mutex::new(Chain::default()),
        }
    }

    /// Builder-style fault injection.
    pub fn with_fault(self, fault: Fault) -> Self {
        self.inject(fault);
        self
    }

    /// Register a proxy that already exists on chain, e.g. one recorded in a ledger.
    pub fn adopt(&self, kind: ModuleKind, address: Address, logic: LogicRef) {
        self.chain().proxies.insert(
            address,
            SimulatedProxy {
                kind,
                logic,
                init_args: Vec::new(),
                settings: BTreeMap::new(),
            },
        );
    }

    pub fn inject(&self, fault: Fault) {
        tracing::debug!(?fault, "Simulated backend: fault injected");
        self.chain().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.chain().faults.clear();
    }

    pub fn deployer(&self) -> Address {
        self.deployer
    }

    /// Every transaction accepted so far, in submission order.
    pub fn journal(&self) -> Vec<Submission> {
        self.chain().journal.clone()
    }

    /// Number of proxy creations accepted for `kind`.
    pub fn creations_of(&self, kind: &ModuleKind) -> usize {
        self.chain()
            .journal
            .iter()
            .filter(|s| matches!(&s.action, SubmittedAction::CreateProxy { kind: k, .. } if k == kind))
            .count()
    }

    pub fn proxy(&self, address: Address) -> Option<SimulatedProxy> {
        self.chain().proxies.get(&address).cloned()
    }

    fn chain(&self) -> MutexGuard<'_, Chain> {
        match self.chain.lock() {
            Ok(chain) => chain,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn submit_create(
        &self,
        kind: &ModuleKind,
        logic: &LogicRef,
        args: &[ArgValue],
    ) -> Result<ProxyDeployment, BackendError> {
        if logic.initializer.params.len() != args.len() {
            return Err(BackendError::Rejected(format!(
                "{} expects {} argument(s), got {}",
                logic.initializer,
                logic.initializer.params.len(),
                args.len()
            )));
        }

        let mut chain = self.chain();
        if chain.take_fault(|f| matches!(f, Fault::RejectCreate { kind: k } if k == kind)) {
            return Err(BackendError::Rejected(format!(
                "creation of {kind} refused by the node"
            )));
        }

        // Adopted proxies may sit on addresses this deployer would reach; never overwrite one.
        while chain.proxies.contains_key(&self.deployer.create(chain.nonce)) {
            chain.nonce += 1;
        }
        let address = self.deployer.create(chain.nonce);
        let tx_hash = chain.next_tx(self.deployer);
        chain.proxies.insert(
            address,
            SimulatedProxy {
                kind: kind.clone(),
                logic: logic.clone(),
                init_args: args.to_vec(),
                settings: BTreeMap::new(),
            },
        );
        chain.settle(
            tx_hash,
            kind,
            false,
            SubmittedAction::CreateProxy {
                kind: kind.clone(),
                address,
                logic: logic.clone(),
                args: args.to_vec(),
            },
        );

        Ok(ProxyDeployment { address, tx_hash })
    }

    fn submit_upgrade(&self, address: Address, logic: &LogicRef) -> Result<TxHash, BackendError> {
        let mut chain = self.chain();
        let kind = chain
            .proxies
            .get(&address)
            .map(|p| p.kind.clone())
            .ok_or_else(|| BackendError::Rejected(format!("no proxy at {address}")))?;

        if chain.take_fault(|f| matches!(f, Fault::RejectUpgrade { kind: k } if *k == kind)) {
            return Err(BackendError::Rejected(format!(
                "upgrade of {kind} refused by the node"
            )));
        }

        let tx_hash = chain.next_tx(self.deployer);
        if let Some(proxy) = chain.proxies.get_mut(&address) {
            proxy.logic = logic.clone();
        }
        chain.settle(
            tx_hash,
            &kind,
            false,
            SubmittedAction::UpgradeProxy {
                kind: kind.clone(),
                address,
                logic: logic.clone(),
            },
        );
        Ok(tx_hash)
    }

    fn submit_call(
        &self,
        address: Address,
        method: &MethodSignature,
        args: &[ArgValue],
    ) -> Result<TxHash, BackendError> {
        if method.params.len() != args.len() {
            return Err(BackendError::Rejected(format!(
                "{method} expects {} argument(s), got {}",
                method.params.len(),
                args.len()
            )));
        }

        let mut chain = self.chain();
        let kind = chain
            .proxies
            .get(&address)
            .map(|p| p.kind.clone())
            .ok_or_else(|| BackendError::Rejected(format!("no contract at {address}")))?;

        let signature = method.to_string();
        let reverted = chain.take_revert(&method.name, &signature);

        let tx_hash = chain.next_tx(self.deployer);
        if !reverted {
            if let Some(proxy) = chain.proxies.get_mut(&address) {
                proxy.settings.insert(signature, args.to_vec());
            }
        }
        chain.settle(
            tx_hash,
            &kind,
            reverted,
            SubmittedAction::Call {
                kind: kind.clone(),
                address,
                method: method.clone(),
                args: args.to_vec(),
            },
        );
        Ok(tx_hash)
    }
}

impl Chain {
    fn next_tx(&mut self, deployer: Address) -> TxHash {
        let mut preimage = deployer.to_vec();
        preimage.extend(self.nonce.to_be_bytes());
        self.nonce += 1;
        keccak256(preimage)
    }

    /// Remove the first fault matching `predicate`.
    fn take_fault(&mut self, predicate: impl Fn(&Fault) -> bool) -> bool {
        match self.faults.iter().position(predicate) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }

    fn take_revert(&mut self, name: &str, signature: &str) -> bool {
        let Some(i) = self.faults.iter().position(|f| {
            matches!(f, Fault::RevertCall { method, .. } if method == name || method == signature)
        }) else {
            return false;
        };

        if let Fault::RevertCall { times, .. } = &mut self.faults[i] {
            *times = times.saturating_sub(1);
            if *times == 0 {
                self.faults.remove(i);
            }
        }
        true
    }

    fn settle(&mut self, tx_hash: TxHash, kind: &ModuleKind, reverted: bool, action: SubmittedAction) {
        if self.take_fault(|f| matches!(f, Fault::WithholdConfirmation { kind: k } if k == kind)) {
            self.withheld.insert(tx_hash);
        }
        let outcome = if reverted {
            Confirmation::Reverted
        } else {
            Confirmation::Confirmed
        };
        self.receipts.insert(tx_hash, outcome);
        self.journal.push(Submission {
            tx_hash,
            action,
            reverted,
        });
    }
}

impl ExecutionBackend for SimulatedBackend {
    async fn create_proxy(
        &self,
        kind: &ModuleKind,
        logic: &LogicRef,
        args: &[ArgValue],
    ) -> Result<ProxyDeployment, BackendError> {
        let deployment = self.submit_create(kind, logic, args)?;
        tracing::debug!(kind = %kind, address = %deployment.address, "Simulated proxy created");
        Ok(deployment)
    }

    async fn upgrade_proxy(&self, address: Address, logic: &LogicRef) -> Result<TxHash, BackendError> {
        self.submit_upgrade(address, logic)
    }

    async fn call(
        &self,
        address: Address,
        method: &MethodSignature,
        args: &[ArgValue],
    ) -> Result<TxHash, BackendError> {
        self.submit_call(address, method, args)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        _timeout: Duration,
    ) -> Result<Confirmation, BackendError> {
        let chain = self.chain();
        if chain.withheld.contains(&tx_hash) {
            return Ok(Confirmation::Unconfirmed);
        }
        chain
            .receipts
            .get(&tx_hash)
            .copied()
            .ok_or_else(|| BackendError::Transport(format!("unknown transaction {tx_hash}")))
    }
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::U256;

    use super::*;

    fn logic(version: &str) -> LogicRef {
        LogicRef {
            contract: "StakeFXVault".to_string(),
            version: version.to_string(),
            initializer: "initialize(uint256)".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn proxies_get_create_addresses() {
        let backend = SimulatedBackend::default();
        let kind = ModuleKind::from("Vault");
        let args = [ArgValue::Uint(U256::from(1))];

        let first = backend.create_proxy(&kind, &logic("1"), &args).await.unwrap();
        let second = backend.create_proxy(&kind, &logic("1"), &args).await.unwrap();

        assert_eq!(first.address, backend.deployer().create(0));
        assert_eq!(second.address, backend.deployer().create(1));
        assert_ne!(first.tx_hash, second.tx_hash);
        assert_eq!(
            backend
                .wait_for_confirmation(first.tx_hash, Duration::from_secs(1))
                .await
                .unwrap(),
            Confirmation::Confirmed
        );
        assert_eq!(backend.creations_of(&kind), 2);
    }

    #[tokio::test]
    async fn upgrade_swaps_logic_only() {
        let backend = SimulatedBackend::default();
        let kind = ModuleKind::from("Vault");
        let deployment = backend
            .create_proxy(&kind, &logic("1"), &[ArgValue::Uint(U256::from(1))])
            .await
            .unwrap();

        backend
            .upgrade_proxy(deployment.address, &logic("2"))
            .await
            .unwrap();
        let proxy = backend.proxy(deployment.address).unwrap();
        assert_eq!(proxy.logic.version, "2");
        assert_eq!(proxy.init_args, vec![ArgValue::Uint(U256::from(1))]);

        let err = backend
            .upgrade_proxy(Address::repeat_byte(0x99), &logic("2"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn reverted_calls_do_not_change_state() {
        let backend = SimulatedBackend::default().with_fault(Fault::RevertCall {
            method: "setFeeRate".to_string(),
            times: 1,
        });
        let kind = ModuleKind::from("Vault");
        let address = backend
            .create_proxy(&kind, &logic("1"), &[ArgValue::Uint(U256::from(1))])
            .await
            .unwrap()
            .address;
        let method: MethodSignature = "setFeeRate(uint256)".parse().unwrap();
        let args = [ArgValue::Uint(U256::from(30))];

        let tx = backend.call(address, &method, &args).await.unwrap();
        assert_eq!(
            backend.wait_for_confirmation(tx, Duration::ZERO).await.unwrap(),
            Confirmation::Reverted
        );
        assert!(backend.proxy(address).unwrap().settings.is_empty());

        let tx = backend.call(address, &method, &args).await.unwrap();
        assert_eq!(
            backend.wait_for_confirmation(tx, Duration::ZERO).await.unwrap(),
            Confirmation::Confirmed
        );
        assert_eq!(
            backend.proxy(address).unwrap().settings["setFeeRate(uint256)"],
            args.to_vec()
        );
    }

    #[tokio::test]
    async fn rejected_creation_consumes_no_nonce() {
        let kind = ModuleKind::from("Vault");
        let backend = SimulatedBackend::default().with_fault(Fault::RejectCreate { kind: kind.clone() });
        let args = [ArgValue::Uint(U256::from(1))];

        assert!(backend.create_proxy(&kind, &logic("1"), &args).await.is_err());
        let deployment = backend.create_proxy(&kind, &logic("1"), &args).await.unwrap();
        assert_eq!(deployment.address, backend.deployer().create(0));
        assert_eq!(backend.journal().len(), 1);
    }

    #[tokio::test]
    async fn creations_skip_adopted_addresses() {
        let backend = SimulatedBackend::default();
        let taken = backend.deployer().create(0);
        backend.adopt(ModuleKind::from("Vault"), taken, logic("1"));

        let kind = ModuleKind::from("Treasury");
        let deployment = backend
            .create_proxy(&kind, &logic("1"), &[ArgValue::Uint(U256::from(1))])
            .await
            .unwrap();
        assert_eq!(deployment.address, backend.deployer().create(1));
        assert_eq!(
            backend.proxy(taken).unwrap().kind,
            ModuleKind::from("Vault")
        );
    }

    #[tokio::test]
    async fn withheld_transactions_stay_unconfirmed() {
        let kind = ModuleKind::from("Vault");
        let backend =
            SimulatedBackend::default().with_fault(Fault::WithholdConfirmation { kind: kind.clone() });
        let deployment = backend
            .create_proxy(&kind, &logic("1"), &[ArgValue::Uint(U256::from(1))])
            .await
            .unwrap();

        assert_eq!(
            backend
                .wait_for_confirmation(deployment.tx_hash, Duration::from_millis(10))
                .await
                .unwrap(),
            Confirmation::Unconfirmed
        );
        // The transaction landed; only its receipt is missing.
        assert!(backend.proxy(deployment.address).is_some());
    }
}
