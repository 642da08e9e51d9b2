//! Deployment target: which modules to converge on, at which logic version, with which
//! initializer arguments, and the ordered post-deployment wiring/configuration sequence.

use std::collections::{BTreeMap, HashSet};

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ArgValue, DeployError, MethodSignature, ModuleKind, ParamSource, Registry, value::is_identifier,
};

/// Desired state of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleTarget {
    /// Logic version the proxy must run.
    pub version: String,
    /// Scalar initializer arguments by parameter name. Reference slots are left out; the
    /// planner fills them with the dependency's address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
}

/// One step of the post-deployment pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PostDeployStep {
    /// Call `module.<setter>(address of target)`.
    Wire {
        module: ModuleKind,
        setter: String,
        target: ModuleKind,
    },
    /// Call `module.<method>(args...)`, `method` being a full signature.
    Configure {
        module: ModuleKind,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// The caller's description of the module graph to converge on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub modules: BTreeMap<ModuleKind, ModuleTarget>,
    /// Pre-existing external addresses. Pinned kinds are never deployed or upgraded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pinned: BTreeMap<ModuleKind, Address>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_deploy: Vec<PostDeployStep>,
}

/// A module target whose arguments have been coerced against the registry schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedModule {
    pub version: String,
    pub args: BTreeMap<String, ArgValue>,
}

/// A post-deployment step with a parsed signature and typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedStep {
    Wire {
        module: ModuleKind,
        setter: MethodSignature,
        target: ModuleKind,
    },
    Configure {
        module: ModuleKind,
        method: MethodSignature,
        args: Vec<ArgValue>,
    },
}

impl ValidatedStep {
    pub fn module(&self) -> &ModuleKind {
        match self {
            Self::Wire { module, .. } | Self::Configure { module, .. } => module,
        }
    }

    pub fn method(&self) -> &MethodSignature {
        match self {
            Self::Wire { setter, .. } => setter,
            Self::Configure { method, .. } => method,
        }
    }
}

/// Output of [`TargetSpec::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTarget {
    pub modules: BTreeMap<ModuleKind, ValidatedModule>,
    pub pinned: BTreeMap<ModuleKind, Address>,
    pub steps: Vec<ValidatedStep>,
}

impl TargetSpec {
    pub fn module(mut self, kind: impl Into<ModuleKind>, version: impl Into<String>) -> Self {
        self.modules.insert(
            kind.into(),
            ModuleTarget {
                version: version.into(),
                args: BTreeMap::new(),
            },
        );
        self
    }

    /// Set a scalar argument on an already added module.
    pub fn arg(mut self, kind: impl Into<ModuleKind>, name: impl Into<String>, value: Value) -> Self {
        if let Some(module) = self.modules.get_mut(&kind.into()) {
            module.args.insert(name.into(), value);
        }
        self
    }

    pub fn pin(mut self, kind: impl Into<ModuleKind>, address: Address) -> Self {
        self.pinned.insert(kind.into(), address);
        self
    }

    pub fn wire(
        mut self,
        module: impl Into<ModuleKind>,
        setter: impl Into<String>,
        target: impl Into<ModuleKind>,
    ) -> Self {
        self.post_deploy.push(PostDeployStep::Wire {
            module: module.into(),
            setter: setter.into(),
            target: target.into(),
        });
        self
    }

    pub fn configure(
        mut self,
        module: impl Into<ModuleKind>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        self.post_deploy.push(PostDeployStep::Configure {
            module: module.into(),
            method: method.into(),
            args,
        });
        self
    }

    /// Validate the target against the registry. Pure: no ledger, no backend.
    pub fn validate(&self, registry: &Registry) -> Result<ValidatedTarget, DeployError> {
        for kind in self.pinned.keys() {
            registry.describe(kind)?;
            if self.modules.contains_key(kind) {
                return Err(DeployError::InvalidTarget(format!(
                    "{kind} is both pinned and targeted"
                )));
            }
        }

        let mut modules = BTreeMap::new();
        for (kind, target) in &self.modules {
            let descriptor = registry.describe(kind)?;
            if target.version.trim().is_empty() {
                return Err(DeployError::InvalidTarget(format!(
                    "{kind} has an empty logic version"
                )));
            }

            let mut args = BTreeMap::new();
            for param in &descriptor.params {
                match (&param.source, target.args.get(&param.name)) {
                    (ParamSource::Scalar { ty }, Some(raw)) => {
                        let name = format!("{kind}.{}", param.name);
                        args.insert(param.name.clone(), ArgValue::coerce(&name, *ty, raw)?);
                    }
                    (ParamSource::Scalar { ty }, None) => {
                        return Err(DeployError::InvalidTarget(format!(
                            "{kind} is missing initializer argument '{}' ({ty})",
                            param.name
                        )));
                    }
                    (ParamSource::Reference { module }, Some(_)) => {
                        return Err(DeployError::InvalidTarget(format!(
                            "{kind}.{} is the address of {module} and is resolved by the planner",
                            param.name
                        )));
                    }
                    (ParamSource::Reference { .. }, None) => {}
                }
            }

            if let Some(extra) = target
                .args
                .keys()
                .find(|name| !descriptor.params.iter().any(|p| &p.name == *name))
            {
                return Err(DeployError::InvalidTarget(format!(
                    "{kind} has no initializer parameter named '{extra}'"
                )));
            }

            modules.insert(
                kind.clone(),
                ValidatedModule {
                    version: target.version.clone(),
                    args,
                },
            );
        }

        let mut steps = Vec::with_capacity(self.post_deploy.len());
        let mut seen = HashSet::new();
        for step in &self.post_deploy {
            let validated = match step {
                PostDeployStep::Wire {
                    module,
                    setter,
                    target,
                } => {
                    registry.describe(module)?;
                    registry.describe(target)?;
                    if !is_identifier(setter) {
                        return Err(DeployError::InvalidTarget(format!(
                            "wire setter '{setter}' on {module} is not a method name"
                        )));
                    }
                    ValidatedStep::Wire {
                        module: module.clone(),
                        setter: MethodSignature::setter(setter.clone()),
                        target: target.clone(),
                    }
                }
                PostDeployStep::Configure {
                    module,
                    method,
                    args,
                } => {
                    registry.describe(module)?;
                    let method: MethodSignature = method.parse()?;
                    let args = method.coerce_args(args)?;
                    ValidatedStep::Configure {
                        module: module.clone(),
                        method,
                        args,
                    }
                }
            };

            let key = (validated.module().clone(), validated.method().to_string());
            if !seen.insert(key) {
                return Err(DeployError::InvalidTarget(format!(
                    "{}.{} appears more than once in the post-deployment sequence",
                    validated.module(),
                    validated.method()
                )));
            }
            steps.push(validated);
        }

        Ok(ValidatedTarget {
            modules,
            pinned: self.pinned.clone(),
            steps,
        })
    }
}
