//! Attribute-level reconciliation policies.
//!
//! Each attribute of a managed instance is governed by one [`Policy`]. The
//! single entry point [`evaluate`] decides which value is carried into the
//! plan given the caller's desired value, the last observed value, and the
//! cycle context. Evaluation is pure: inputs are borrowed and never mutated.

mod registry;

use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub use registry::{AttributeRegistry, Dependency, DependencyEdge, DependencyGraph, RegistryError};

/// Value supplied by the caller for one attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// A concrete value.
    Known(Value),
    /// A value that is not yet known, for example because it is computed
    /// from another resource still being planned.
    Unresolved,
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        Self::Known(value)
    }
}

/// Value carried forward into a plan for one attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum PlannedValue {
    /// The value the attribute will hold after the cycle.
    Known(Value),
    /// The value is computed remotely and cannot be predicted.
    Unresolved,
}

impl PlannedValue {
    /// Returns the known value, if any.
    #[must_use]
    pub const fn as_known(&self) -> Option<&Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unresolved => None,
        }
    }

    /// Returns `true` when the value is unresolved.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unresolved => f.write_str("(known after apply)"),
        }
    }
}

/// Mutation policy attached to an attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Policy {
    /// Desired value wins when set; otherwise the observed value is kept.
    #[default]
    Mutable,
    /// Settable only at creation; any later change is a conflict.
    Immutable,
    /// Used at creation; later divergence is ignored.
    IgnoreAfterCreate,
    /// Computed remotely; unresolved whenever a dependency changes.
    RecomputeOnChange,
    /// Computed remotely unless the caller sets it explicitly.
    PreserveUnlessExplicit,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Mutable => "mutable",
            Self::Immutable => "immutable",
            Self::IgnoreAfterCreate => "ignore-after-create",
            Self::RecomputeOnChange => "recompute-on-change",
            Self::PreserveUnlessExplicit => "preserve-unless-explicit",
        };
        f.write_str(label)
    }
}

/// Flags describing the cycle an attribute is evaluated in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EvaluationContext {
    /// The resource does not exist yet.
    pub creating: bool,
    /// The resource is being removed.
    pub destroying: bool,
    /// A dependency of this attribute changed during the cycle.
    pub dependency_changed: bool,
}

impl EvaluationContext {
    /// Context for a resource that does not exist yet.
    #[must_use]
    pub const fn creating() -> Self {
        Self {
            creating: true,
            destroying: false,
            dependency_changed: false,
        }
    }

    /// Context for an update of an existing resource.
    #[must_use]
    pub const fn updating() -> Self {
        Self {
            creating: false,
            destroying: false,
            dependency_changed: false,
        }
    }

    /// Context for a resource being removed.
    #[must_use]
    pub const fn destroying() -> Self {
        Self {
            creating: false,
            destroying: true,
            dependency_changed: false,
        }
    }

    /// Marks that a dependency changed.
    #[must_use]
    pub const fn with_dependency_changed(mut self, changed: bool) -> Self {
        self.dependency_changed = changed;
        self
    }
}

/// Raised when the caller asks to change an immutable attribute.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("attribute '{attribute}' is immutable: observed {observed}, desired {desired}")]
pub struct PolicyConflict {
    /// Attribute the caller tried to change.
    pub attribute: String,
    /// Requested value.
    pub desired: Value,
    /// Value the resource holds.
    pub observed: Value,
}

/// Decides the value carried into the plan for one attribute.
///
/// Returns `Ok(None)` when the attribute has neither a desired nor an
/// observed value and therefore does not appear in the plan.
///
/// # Errors
///
/// Returns [`PolicyConflict`] when an [`Policy::Immutable`] attribute is
/// asked to change on an existing resource.
pub fn evaluate(
    attribute: &str,
    policy: Policy,
    desired: Option<&AttributeValue>,
    observed: Option<&Value>,
    context: EvaluationContext,
) -> Result<Option<PlannedValue>, PolicyConflict> {
    let wanted = match desired {
        Some(AttributeValue::Unresolved) => return Ok(Some(PlannedValue::Unresolved)),
        Some(AttributeValue::Known(value)) => Some(value),
        None => None,
    };
    let current = observed.filter(|value| !value.is_null());

    if context.destroying {
        return Ok(current.cloned().map(PlannedValue::Known));
    }

    let Some(prior) = current.filter(|_| !context.creating) else {
        return Ok(on_create(policy, wanted));
    };

    let planned = match policy {
        Policy::Mutable | Policy::PreserveUnlessExplicit => wanted.unwrap_or(prior).clone(),
        Policy::Immutable => match wanted {
            Some(value) if value != prior => {
                return Err(PolicyConflict {
                    attribute: attribute.to_owned(),
                    desired: value.clone(),
                    observed: prior.clone(),
                });
            }
            _ => prior.clone(),
        },
        Policy::IgnoreAfterCreate => prior.clone(),
        Policy::RecomputeOnChange if context.dependency_changed => {
            return Ok(Some(PlannedValue::Unresolved));
        }
        Policy::RecomputeOnChange => prior.clone(),
    };
    Ok(Some(PlannedValue::Known(planned)))
}

fn on_create(policy: Policy, desired: Option<&Value>) -> Option<PlannedValue> {
    match (policy, desired) {
        (Policy::RecomputeOnChange, _) | (Policy::PreserveUnlessExplicit, None) => {
            Some(PlannedValue::Unresolved)
        }
        (_, Some(value)) => Some(PlannedValue::Known(value.clone())),
        (_, None) => None,
    }
}
