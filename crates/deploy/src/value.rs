//! Typed constructor and configuration argument values.
//!
//! Parameter types are written as Solidity type names (`address`, `uint256`, `bool`,
//! `string`, `address[]`). Raw values coming from the target (JSON or TOML)
//! are coerced into [`ArgValue`]s against those types before any planning happens.

use std::{fmt, str::FromStr};

use alloy_core::primitives::{Address, U256, keccak256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DeployError;

/// The type of a scalar (non-reference) parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScalarType {
    Address,
    /// Unsigned integer with the given bit width (8..=256, multiple of 8).
    Uint(u16),
    Bool,
    String,
    AddressArray,
}

impl FromStr for ScalarType {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DeployError::InvalidValue {
            name: s.to_string(),
            reason: reason.to_string(),
        };

        match s.trim() {
            "address" => Ok(Self::Address),
            "bool" => Ok(Self::Bool),
            "string" => Ok(Self::String),
            "address[]" => Ok(Self::AddressArray),
            "uint" => Ok(Self::Uint(256)),
            other => {
                let bits = other
                    .strip_prefix("uint")
                    .ok_or_else(|| invalid("unsupported parameter type"))?
                    .parse::<u16>()
                    .map_err(|_| invalid("unsupported parameter type"))?;
                if bits == 0 || bits > 256 || bits % 8 != 0 {
                    return Err(invalid("uint width must be a multiple of 8 up to 256"));
                }
                Ok(Self::Uint(bits))
            }
        }
    }
}

impl TryFrom<String> for ScalarType {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScalarType> for String {
    fn from(value: ScalarType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address => f.write_str("address"),
            Self::Uint(bits) => write!(f, "uint{bits}"),
            Self::Bool => f.write_str("bool"),
            Self::String => f.write_str("string"),
            Self::AddressArray => f.write_str("address[]"),
        }
    }
}

/// A fully typed argument value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Address(Address),
    Uint(U256),
    Bool(bool),
    String(String),
    AddressArray(Vec<Address>),
}

impl ArgValue {
    /// Coerce a raw JSON/TOML value into a typed value of type `ty`.
    ///
    /// `name` is only used to build a readable error.
    pub fn coerce(name: &str, ty: ScalarType, raw: &Value) -> Result<Self, DeployError> {
        let invalid = |reason: String| DeployError::InvalidValue {
            name: name.to_string(),
            reason,
        };

        match (ty, raw) {
            (ScalarType::Address, Value::String(s)) => parse_address(s)
                .map(Self::Address)
                .map_err(invalid),
            (ScalarType::Uint(bits), Value::Number(n)) => {
                let value = n
                    .as_u64()
                    .ok_or_else(|| invalid(format!("{n} is not an unsigned integer")))?;
                check_width(U256::from(value), bits).map_err(invalid)
            }
            (ScalarType::Uint(bits), Value::String(s)) => {
                let value = U256::from_str(s.trim())
                    .map_err(|e| invalid(format!("'{s}' is not an unsigned integer: {e}")))?;
                check_width(value, bits).map_err(invalid)
            }
            (ScalarType::Bool, Value::Bool(b)) => Ok(Self::Bool(*b)),
            (ScalarType::String, Value::String(s)) => Ok(Self::String(s.clone())),
            (ScalarType::AddressArray, Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => parse_address(s),
                    other => Err(format!("expected an address string, got {other}")),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::AddressArray)
                .map_err(invalid),
            (ty, raw) => Err(invalid(format!("expected {ty}, got {raw}"))),
        }
    }

    /// The scalar type this value belongs to.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Address(_) => ScalarType::Address,
            Self::Uint(_) => ScalarType::Uint(256),
            Self::Bool(_) => ScalarType::Bool,
            Self::String(_) => ScalarType::String,
            Self::AddressArray(_) => ScalarType::AddressArray,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::AddressArray(addresses) => {
                let joined = addresses
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[{joined}]")
            }
        }
    }
}

fn parse_address(s: &str) -> Result<Address, String> {
    Address::from_str(s.trim()).map_err(|e| format!("'{s}' is not an address: {e}"))
}

fn check_width(value: U256, bits: u16) -> Result<ArgValue, String> {
    if value.bit_len() > bits as usize {
        return Err(format!("{value} does not fit in uint{bits}"));
    }
    Ok(ArgValue::Uint(value))
}

/// A Solidity-style method signature such as `setFeeRate(uint256)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ScalarType>,
}

impl MethodSignature {
    /// The signature of a single-address setter, used for wiring.
    pub fn setter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: vec![ScalarType::Address],
        }
    }

    /// The 4-byte function selector.
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.to_string().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// Coerce raw argument values against this signature's parameter types.
    pub fn coerce_args(&self, raw: &[Value]) -> Result<Vec<ArgValue>, DeployError> {
        if raw.len() != self.params.len() {
            return Err(DeployError::InvalidValue {
                name: self.to_string(),
                reason: format!("expected {} argument(s), got {}", self.params.len(), raw.len()),
            });
        }

        self.params
            .iter()
            .zip(raw)
            .enumerate()
            .map(|(i, (ty, value))| ArgValue::coerce(&format!("{}[{i}]", self.name), *ty, value))
            .collect()
    }
}

impl FromStr for MethodSignature {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DeployError::InvalidValue {
            name: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        let (name, rest) = s
            .split_once('(')
            .ok_or_else(|| invalid("method signature must look like name(type,...)"))?;
        let params = rest
            .strip_suffix(')')
            .ok_or_else(|| invalid("method signature is missing a closing parenthesis"))?;

        if !is_identifier(name) {
            return Err(invalid("method name is not a valid identifier"));
        }

        let params = if params.trim().is_empty() {
            Vec::new()
        } else {
            params
                .split(',')
                .map(ScalarType::from_str)
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            name: name.to_string(),
            params,
        })
    }
}

impl TryFrom<String> for MethodSignature {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MethodSignature> for String {
    fn from(value: MethodSignature) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}({})", self.name, params)
    }
}

/// Returns true if `s` is a valid Solidity identifier.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
