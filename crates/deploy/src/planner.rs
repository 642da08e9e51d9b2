//! Deployment planner.
//!
//! Turns a target, the ledger and the registry into an ordered list of [`Action`]s. Phase
//! one is the dependency-ordered Deploy/Upgrade/Skip list; phase two is the declared
//! post-deployment sequence, which runs only once every module has its final address.
//! Planning is pure: nothing here touches a backend or writes the ledger.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use alloy_core::primitives::Address;

use crate::{
    ArgValue, DeployError, LedgerSnapshot, LogicRef, MethodSignature, ModuleKind, ParamSource,
    Registry, TargetSpec, ValidatedStep, fingerprint,
};

/// Value of an initializer argument at plan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgSlot {
    Value(ArgValue),
    /// Address of a module deployed earlier in the same run, resolved at execution time.
    AddressOf(ModuleKind),
}

/// A named initializer argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedArg {
    pub name: String,
    pub slot: ArgSlot,
}

impl fmt::Display for PlannedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            ArgSlot::Value(value) => write!(f, "{}={value}", self.name),
            ArgSlot::AddressOf(kind) => write!(f, "{}=<{kind}>", self.name),
        }
    }
}

/// One planned step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Deploy {
        kind: ModuleKind,
        logic: LogicRef,
        args: Vec<PlannedArg>,
    },
    Upgrade {
        kind: ModuleKind,
        address: Address,
        from_version: String,
        logic: LogicRef,
    },
    /// Already deployed at the requested version; only feeds the resolution table.
    Skip { kind: ModuleKind, address: Address },
    Wire {
        kind: ModuleKind,
        setter: MethodSignature,
        target: ModuleKind,
    },
    Configure {
        kind: ModuleKind,
        method: MethodSignature,
        args: Vec<ArgValue>,
    },
}

impl Action {
    pub fn kind(&self) -> &ModuleKind {
        match self {
            Self::Deploy { kind, .. }
            | Self::Upgrade { kind, .. }
            | Self::Skip { kind, .. }
            | Self::Wire { kind, .. }
            | Self::Configure { kind, .. } => kind,
        }
    }

    /// Short action name, for tables and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deploy { .. } => "deploy",
            Self::Upgrade { .. } => "upgrade",
            Self::Skip { .. } => "skip",
            Self::Wire { .. } => "wire",
            Self::Configure { .. } => "configure",
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }

    /// Whether this action writes the ledger entry of its kind.
    pub fn mutates_ledger(&self) -> bool {
        !self.is_skip()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy { kind, logic, args } => {
                let args = args.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "deploy {kind} ({logic}) [{}]", args.join(", "))
            }
            Self::Upgrade {
                kind,
                address,
                from_version,
                logic,
            } => write!(
                f,
                "upgrade {kind} at {address} from {from_version} to {}",
                logic.version
            ),
            Self::Skip { kind, address } => write!(f, "skip {kind} at {address}"),
            Self::Wire {
                kind,
                setter,
                target,
            } => write!(f, "wire {kind}.{} <- {target}", setter.name),
            Self::Configure { kind, method, args } => {
                let args = args.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "configure {kind}.{}({})", method.name, args.join(", "))
            }
        }
    }
}

/// An ordered, immutable list of actions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    actions: Vec<Action>,
    /// Addresses known at plan time: pinned modules and modules already deployed.
    resolved: BTreeMap<ModuleKind, Address>,
}

impl Plan {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn resolved(&self) -> &BTreeMap<ModuleKind, Address> {
        &self.resolved
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// True when every action is a Skip: the ledger already matches the target.
    pub fn is_converged(&self) -> bool {
        self.actions.iter().all(Action::is_skip)
    }

    /// Kinds whose ledger entries executing this plan may write.
    pub fn mutated_kinds(&self) -> BTreeSet<ModuleKind> {
        self.actions
            .iter()
            .filter(|a| a.mutates_ledger())
            .map(|a| a.kind().clone())
            .collect()
    }
}

/// Compute the plan converging `ledger` on `target`.
///
/// Fails without side effects on an invalid target, an unknown kind, a dependency that is
/// neither deployed, targeted, nor pinned, or a needed kind with an unreconciled operation.
pub fn plan(
    target: &TargetSpec,
    ledger: &LedgerSnapshot,
    registry: &Registry,
) -> Result<Plan, DeployError> {
    let target = target.validate(registry)?;
    let address_in_ledger = |kind: &ModuleKind| ledger.get(kind).and_then(|r| r.address);

    // Kinds needed by the run, with the kind that first required each one.
    let mut required_by: HashMap<ModuleKind, Option<ModuleKind>> = HashMap::new();
    let mut stack: Vec<ModuleKind> = Vec::new();
    for kind in target.modules.keys() {
        required_by.insert(kind.clone(), None);
        stack.push(kind.clone());
    }
    for step in &target.steps {
        let module = step.module();
        if target.pinned.contains_key(module) {
            return Err(DeployError::InvalidTarget(format!(
                "{module} is pinned to an external address and cannot be wired or configured"
            )));
        }
        if !required_by.contains_key(module) {
            if address_in_ledger(module).is_none() {
                return Err(DeployError::InvalidTarget(format!(
                    "cannot apply {module}.{}: {module} is neither targeted nor deployed",
                    step.method().name
                )));
            }
            required_by.insert(module.clone(), None);
            stack.push(module.clone());
        }
        if let ValidatedStep::Wire { target: wired, .. } = step {
            if !target.pinned.contains_key(wired) && !required_by.contains_key(wired) {
                required_by.insert(wired.clone(), Some(module.clone()));
                stack.push(wired.clone());
            }
        }
    }
    while let Some(kind) = stack.pop() {
        for dep in registry.describe(&kind)?.dependencies() {
            if target.pinned.contains_key(dep) || required_by.contains_key(dep) {
                continue;
            }
            required_by.insert(dep.clone(), Some(kind.clone()));
            stack.push(dep.clone());
        }
    }

    let order = topological_order(registry, &required_by, &target.pinned)?;

    let mut resolved: BTreeMap<ModuleKind, Address> = target.pinned.clone();
    let mut deployed_now: BTreeSet<ModuleKind> = BTreeSet::new();
    let mut actions = Vec::with_capacity(order.len() + target.steps.len());

    for kind in order {
        if let Some(pending) = ledger.get(&kind).and_then(|r| r.pending.as_ref()) {
            return Err(DeployError::PendingReconciliation {
                operation: pending.to_string(),
                kind,
            });
        }
        let current = ledger.get(&kind).filter(|r| r.is_deployed());
        let Some(wanted) = target.modules.get(&kind) else {
            // Needed only for its address.
            match current.and_then(|r| r.address) {
                Some(address) => {
                    resolved.insert(kind.clone(), address);
                    actions.push(Action::Skip { kind, address });
                }
                None => {
                    let required_by = required_by.get(&kind).cloned().flatten();
                    return Err(DeployError::UnresolvedDependency {
                        required_by: required_by.unwrap_or_else(|| kind.clone()),
                        kind,
                    });
                }
            }
            continue;
        };

        let descriptor = registry.describe(&kind)?;
        let logic = LogicRef {
            contract: descriptor.contract.clone(),
            version: wanted.version.clone(),
            initializer: descriptor.initializer_signature(),
        };

        match current {
            None => {
                let mut args = Vec::with_capacity(descriptor.params.len());
                for param in &descriptor.params {
                    let slot = match &param.source {
                        ParamSource::Reference { module } => match resolved.get(module) {
                            Some(address) => ArgSlot::Value(ArgValue::Address(*address)),
                            None => ArgSlot::AddressOf(module.clone()),
                        },
                        ParamSource::Scalar { .. } => {
                            let value = wanted.args.get(&param.name).cloned().ok_or_else(|| {
                                DeployError::InvalidTarget(format!(
                                    "{kind} is missing initializer argument '{}'",
                                    param.name
                                ))
                            })?;
                            ArgSlot::Value(value)
                        }
                    };
                    args.push(PlannedArg {
                        name: param.name.clone(),
                        slot,
                    });
                }
                deployed_now.insert(kind.clone());
                actions.push(Action::Deploy { kind, logic, args });
            }
            Some(record) => {
                let Some(address) = record.address else {
                    continue;
                };
                resolved.insert(kind.clone(), address);
                if record.logic_version == wanted.version {
                    actions.push(Action::Skip { kind, address });
                } else {
                    actions.push(Action::Upgrade {
                        kind,
                        address,
                        from_version: record.logic_version.clone(),
                        logic,
                    });
                }
            }
        }
    }

    // Phase two: the declared post-deployment sequence.
    for step in target.steps {
        let (kind, method, args) = match &step {
            ValidatedStep::Wire {
                module,
                setter,
                target: wired,
            } => (
                module,
                setter,
                resolved.get(wired).map(|a| vec![ArgValue::Address(*a)]),
            ),
            ValidatedStep::Configure {
                module,
                method,
                args,
            } => (module, method, Some(args.clone())),
        };

        let already_applied = !deployed_now.contains(kind)
            && args.is_some_and(|args| {
                ledger
                    .get(kind)
                    .and_then(|r| r.applied.get(&method.to_string()))
                    .is_some_and(|applied| *applied == fingerprint(&args))
            });
        if already_applied {
            tracing::debug!(kind = %kind, method = %method, "Setting already applied, omitted");
            continue;
        }

        actions.push(match step {
            ValidatedStep::Wire {
                module,
                setter,
                target,
            } => Action::Wire {
                kind: module,
                setter,
                target,
            },
            ValidatedStep::Configure {
                module,
                method,
                args,
            } => Action::Configure {
                kind: module,
                method,
                args,
            },
        });
    }

    let plan = Plan { actions, resolved };
    tracing::info!(
        actions = plan.len(),
        converged = plan.is_converged(),
        "Deployment plan computed"
    );
    Ok(plan)
}

/// Kahn's algorithm over the needed kinds; ties go to the earliest registry declaration.
fn topological_order(
    registry: &Registry,
    needed: &HashMap<ModuleKind, Option<ModuleKind>>,
    pinned: &BTreeMap<ModuleKind, Address>,
) -> Result<Vec<ModuleKind>, DeployError> {
    let mut indegree: HashMap<&ModuleKind, usize> = HashMap::new();
    let mut dependents: HashMap<&ModuleKind, Vec<&ModuleKind>> = HashMap::new();

    for kind in needed.keys() {
        let deps = registry
            .describe(kind)?
            .dependencies()
            .into_iter()
            .filter(|dep| !pinned.contains_key(*dep))
            .collect::<Vec<_>>();
        indegree.insert(kind, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(kind);
        }
    }

    let position = |kind: &ModuleKind| registry.position(kind).unwrap_or(usize::MAX);
    let mut ready: BTreeSet<(usize, &ModuleKind)> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(kind, _)| (position(*kind), *kind))
        .collect();

    let mut order = Vec::with_capacity(needed.len());
    while let Some((_, kind)) = ready.pop_first() {
        order.push(kind.clone());
        for dependent in dependents.get(kind).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((position(*dependent), *dependent));
                }
            }
        }
    }

    // The registry is acyclic, so every needed kind is emitted; this guards a registry
    // built around the validation.
    if order.len() != needed.len() {
        let stuck: Vec<ModuleKind> = indegree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(kind, _)| kind.clone())
            .collect();
        return Err(DeployError::CyclicDependency { cycle: stuck });
    }
    Ok(order)
}
