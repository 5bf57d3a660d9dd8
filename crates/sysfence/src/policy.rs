//! JSON policy files.
//!
//! A policy declares a filter: actions, architectures, attributes and rules.
//! Rule syscalls are named, and resolved on the native architecture when the
//! policy is built.
//!
//! ```json
//! {
//!   "default_action": "allow",
//!   "arches": ["native", "x86"],
//!   "attributes": { "no_new_privs": true },
//!   "rules": [
//!     { "syscall": "ptrace", "action": { "errno": 1 } },
//!     {
//!       "syscall": "openat",
//!       "action": { "errno": 13 },
//!       "conditions": [{ "arg": 2, "op": "masked_eq", "mask": 3, "value": 1 }]
//!     }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::api::Capabilities;
use crate::arch::Arch;
use crate::condition::{CompareOp, Condition};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::syscall::Syscall;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub default_action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bad_arch_action: Option<Action>,
    /// Architecture names. Empty means native only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arches: Vec<String>,
    #[serde(default)]
    pub attributes: PolicyAttributes,
    /// Pin the API level below what the kernel offers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<u32>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// Unset attributes keep the filter defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_new_privs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssb: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsync: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub syscall: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSpec {
    pub arg: u32,
    pub op: CompareOp,
    pub value: u64,
    /// Required by `masked_eq`, rejected by every other operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u64>,
}

impl ConditionSpec {
    pub fn to_condition(&self) -> Result<Condition> {
        let condition = match self.mask {
            Some(mask) => Condition::new(self.arg, self.op, &[mask, self.value]),
            None => Condition::new(self.arg, self.op, &[self.value]),
        };
        Ok(condition?)
    }
}

impl Policy {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Policy(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| match e {
            Error::Policy(msg) => Error::Policy(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Builds a filter against the running kernel's capabilities.
    pub fn build(&self) -> Result<Filter> {
        self.build_with(Capabilities::detect()?)
    }

    /// Builds a filter against `caps`.
    pub fn build_with(&self, caps: Capabilities) -> Result<Filter> {
        let caps = match self.api_level {
            Some(level) => caps.request_level(level)?,
            None => caps,
        };
        let mut filter = Filter::with_capabilities(self.default_action, caps)?;

        if let Some(action) = self.bad_arch_action {
            filter.set_bad_arch_action(action)?;
        }

        if !self.arches.is_empty() {
            let arches = self
                .arches
                .iter()
                .map(|name| name.parse::<Arch>())
                .collect::<Result<Vec<_>>>()?;
            for &arch in &arches {
                filter.add_arch(arch)?;
            }
            if !arches.contains(&Arch::native()) {
                filter.remove_arch(Arch::native())?;
            }
        }

        let attrs = &self.attributes;
        if let Some(enabled) = attrs.no_new_privs {
            filter.set_no_new_privs(enabled)?;
        }
        if let Some(enabled) = attrs.log {
            filter.set_log(enabled)?;
        }
        if let Some(enabled) = attrs.ssb {
            filter.set_ssb(enabled)?;
        }
        if let Some(enabled) = attrs.tsync {
            filter.set_tsync(enabled)?;
        }

        for rule in &self.rules {
            let syscall = Syscall::from_name(&rule.syscall)?;
            let conditions = rule
                .conditions
                .iter()
                .map(ConditionSpec::to_condition)
                .collect::<Result<Vec<_>>>()?;
            filter.add_conditional_rule(syscall, rule.action, &conditions)?;
        }

        tracing::debug!(
            rules = self.rules.len(),
            arches = ?filter.arches()?,
            "policy built"
        );
        Ok(filter)
    }
}
