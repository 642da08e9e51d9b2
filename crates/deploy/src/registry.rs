//! Module descriptor registry.
//!
//! The registry is the static catalog of module kinds: which contract backs each kind, the
//! ordered parameters of its initializer, and the kinds it depends on. A [`Registry`] can
//! only be obtained through [`RegistryBuilder::build`], which rejects unknown references,
//! duplicate kinds, and dependency cycles, so every registry in circulation is a valid DAG.

use std::{collections::HashMap, fmt};

use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};

use crate::{DeployError, ScalarType};

/// Identifier of a module kind (e.g. `Vault`, `Treasury`).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Deref, From,
)]
#[serde(transparent)]
pub struct ModuleKind(String);

impl ModuleKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the value of an initializer parameter comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSource {
    /// The address of another module, filled in by the planner.
    Reference { module: ModuleKind },
    /// A value supplied by the target.
    Scalar {
        #[serde(rename = "type")]
        ty: ScalarType,
    },
}

/// One initializer parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub source: ParamSource,
}

/// Static description of a module kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub kind: ModuleKind,
    /// Contract (artifact) name of the logic implementation.
    pub contract: String,
    /// Name of the proxy initializer.
    #[serde(default = "default_initializer")]
    pub initializer: String,
    /// Initializer parameters, in call order.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Dependencies that are not constructor references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ModuleKind>,
}

fn default_initializer() -> String {
    "initialize".to_string()
}

impl ModuleDescriptor {
    pub fn new(kind: impl Into<ModuleKind>, contract: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            contract: contract.into(),
            initializer: default_initializer(),
            params: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    /// Append a scalar parameter.
    pub fn scalar(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            source: ParamSource::Scalar { ty },
        });
        self
    }

    /// Append a parameter that receives another module's address.
    pub fn reference(mut self, name: impl Into<String>, module: impl Into<ModuleKind>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            source: ParamSource::Reference {
                module: module.into(),
            },
        });
        self
    }

    /// Declare a dependency that does not appear in the initializer.
    pub fn depends_on(mut self, module: impl Into<ModuleKind>) -> Self {
        self.depends_on.push(module.into());
        self
    }

    /// All dependencies: initializer references first, then explicit ones, without duplicates.
    pub fn dependencies(&self) -> Vec<&ModuleKind> {
        let mut deps: Vec<&ModuleKind> = Vec::new();
        let references = self.params.iter().filter_map(|p| match &p.source {
            ParamSource::Reference { module } => Some(module),
            ParamSource::Scalar { .. } => None,
        });
        for dep in references.chain(self.depends_on.iter()) {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        deps
    }

    /// Signature of the initializer, e.g. `initialize(address,address)`.
    ///
    /// References are always addresses.
    pub fn initializer_signature(&self) -> crate::MethodSignature {
        crate::MethodSignature {
            name: self.initializer.clone(),
            params: self
                .params
                .iter()
                .map(|p| match p.source {
                    ParamSource::Reference { .. } => ScalarType::Address,
                    ParamSource::Scalar { ty } => ty,
                })
                .collect(),
        }
    }
}

/// A validated, read-only catalog of module kinds.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<ModuleDescriptor>,
    index: HashMap<ModuleKind, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The catalog of the staking protocol: vault, fee treasury, vesting, reward
    /// distributor and multicall helper.
    pub fn standard() -> Result<Self, DeployError> {
        Self::builder()
            .module(
                ModuleDescriptor::new("Vault", "StakeFXVault")
                    .scalar("asset", ScalarType::Address)
                    .scalar("owner", ScalarType::Address)
                    .scalar("governor", ScalarType::Address),
            )
            .module(ModuleDescriptor::new("Treasury", "FeeTreasury"))
            .module(
                ModuleDescriptor::new("Vesting", "VestedFX")
                    .reference("stakingVault", "Vault")
                    .reference("feeTreasury", "Treasury"),
            )
            .module(
                ModuleDescriptor::new("Distributor", "RewardDistributor")
                    .scalar("rewardToken", ScalarType::Address)
                    .reference("stakingVault", "Vault")
                    .scalar("owner", ScalarType::Address)
                    .scalar("governor", ScalarType::Address),
            )
            .module(ModuleDescriptor::new("Multicall", "MultiCall").reference("stakingVault", "Vault"))
            .build()
    }

    /// Describe a module kind.
    pub fn describe(&self, kind: &ModuleKind) -> Result<&ModuleDescriptor, DeployError> {
        self.index
            .get(kind)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| DeployError::UnknownModuleKind(kind.clone()))
    }

    /// Declaration order of a kind, used to break ties deterministically.
    pub fn position(&self, kind: &ModuleKind) -> Option<usize> {
        self.index.get(kind).copied()
    }

    pub fn contains(&self, kind: &ModuleKind) -> bool {
        self.index.contains_key(kind)
    }

    /// Descriptors in declaration order.
    pub fn descriptors(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ModuleKind> {
        self.descriptors.iter().map(|d| &d.kind)
    }
}

/// Collects descriptors and validates them into a [`Registry`].
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    descriptors: Vec<ModuleDescriptor>,
}

impl RegistryBuilder {
    pub fn module(mut self, descriptor: ModuleDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn modules(mut self, descriptors: impl IntoIterator<Item = ModuleDescriptor>) -> Self {
        self.descriptors.extend(descriptors);
        self
    }

    /// Validate the catalog.
    ///
    /// Fails with `DuplicateModuleKind`, `UnknownModuleKind` for a dependency that is not
    /// registered, or `CyclicDependency` with the offending path.
    pub fn build(self) -> Result<Registry, DeployError> {
        let mut index = HashMap::with_capacity(self.descriptors.len());
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            if index.insert(descriptor.kind.clone(), i).is_some() {
                return Err(DeployError::DuplicateModuleKind(descriptor.kind.clone()));
            }
        }

        for descriptor in &self.descriptors {
            for dep in descriptor.dependencies() {
                if !index.contains_key(dep) {
                    return Err(DeployError::UnknownModuleKind(dep.clone()));
                }
            }
        }

        let registry = Registry {
            descriptors: self.descriptors,
            index,
        };
        detect_cycle(&registry)?;

        tracing::debug!(modules = registry.descriptors.len(), "Module registry validated");
        Ok(registry)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with recursion-stack marking.
fn detect_cycle(registry: &Registry) -> Result<(), DeployError> {
    let mut marks = vec![Mark::Unvisited; registry.descriptors.len()];
    let mut stack = Vec::new();

    for root in 0..registry.descriptors.len() {
        if marks[root] == Mark::Unvisited {
            visit(registry, root, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

fn visit(
    registry: &Registry,
    node: usize,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Result<(), DeployError> {
    marks[node] = Mark::OnStack;
    stack.push(node);

    for dep in registry.descriptors[node].dependencies() {
        let next = registry.index[dep];
        match marks[next] {
            Mark::OnStack => {
                let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<ModuleKind> = stack[start..]
                    .iter()
                    .map(|&n| registry.descriptors[n].kind.clone())
                    .collect();
                cycle.push(registry.descriptors[next].kind.clone());
                return Err(DeployError::CyclicDependency { cycle });
            }
            Mark::Unvisited => visit(registry, next, marks, stack)?,
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Done;
    Ok(())
}
