//! Plan computation: policies, attachment diff, and dependency walk.

mod report;

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::attachment::{AttachmentChangeSet, DiffError, NetworkAttachment, diff};
use crate::policy::{
    AttributeRegistry, AttributeValue, Dependency, EvaluationContext, PlannedValue,
    PolicyConflict, RegistryError, evaluate,
};
use crate::remote::{Fields, InstanceRepresentation};

pub use report::PlanReport;

/// Field name of the API-assigned identity. Never planned or sent.
pub const ID_FIELD: &str = "id";

/// Caller-declared target configuration for one instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredInstance {
    /// Explicitly set attributes. Absent names were not set by the caller.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Desired attachments in declaration order.
    pub attachments: Vec<NetworkAttachment>,
}

impl DesiredInstance {
    /// Creates a configuration with no attributes and no attachments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an attribute to a known value.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes
            .insert(name.into(), AttributeValue::Known(value));
        self
    }

    /// Marks an attribute as not yet known.
    #[must_use]
    pub fn unresolved(mut self, name: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), AttributeValue::Unresolved);
        self
    }

    /// Appends a desired attachment.
    #[must_use]
    pub fn attachment(mut self, attachment: NetworkAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// On-disk form of a [`DesiredInstance`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DesiredDocument {
    /// Attribute values.
    #[serde(default)]
    pub attributes: Fields,
    /// Desired attachments.
    #[serde(default)]
    pub attachments: Vec<NetworkAttachment>,
}

impl From<DesiredDocument> for DesiredInstance {
    fn from(document: DesiredDocument) -> Self {
        Self {
            attributes: document
                .attributes
                .into_iter()
                .map(|(name, value)| (name, AttributeValue::Known(value)))
                .collect(),
            attachments: document.attachments,
        }
    }
}

/// Errors that abort planning before any remote call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PlanError {
    /// An immutable attribute was asked to change.
    #[error(transparent)]
    Conflict(#[from] PolicyConflict),
    /// An attachment list was malformed.
    #[error(transparent)]
    Diff(#[from] DiffError),
}

/// Policy-reconciled attribute set and attachment change-set.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    /// The resource does not exist yet.
    pub creating: bool,
    /// Planned value per attribute.
    pub attributes: BTreeMap<String, PlannedValue>,
    /// Desired attachments in declaration order.
    pub attachments: Vec<NetworkAttachment>,
    /// Attachment classification against the observed state.
    pub changes: AttachmentChangeSet,
    /// Planned attributes whose values must not be displayed.
    pub sensitive: BTreeSet<String>,
}

impl Plan {
    /// Every attribute with a known planned value.
    #[must_use]
    pub fn known_fields(&self) -> Fields {
        self.attributes
            .iter()
            .filter_map(|(name, value)| Some((name.clone(), value.as_known()?.clone())))
            .collect()
    }

    /// Known planned values that differ from `observed`.
    #[must_use]
    pub fn changed_fields(&self, observed: &Fields) -> Fields {
        self.attributes
            .iter()
            .filter_map(|(name, value)| {
                let planned = value.as_known()?;
                (observed.get(name) != Some(planned)).then(|| (name.clone(), planned.clone()))
            })
            .collect()
    }

    /// Names of attributes whose value is only known after the cycle.
    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, value)| value.is_unresolved())
            .map(|(name, _)| name.as_str())
    }

    /// Returns `true` when applying the plan to `observed` changes nothing.
    #[must_use]
    pub fn is_noop(&self, observed: &Fields) -> bool {
        !self.creating && !self.changes.has_changes() && self.changed_fields(observed).is_empty()
    }
}

/// Computes plans against an [`AttributeRegistry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Planner {
    registry: AttributeRegistry,
}

impl Planner {
    /// Creates a planner over the given schema.
    #[must_use]
    pub const fn new(registry: AttributeRegistry) -> Self {
        Self { registry }
    }

    /// Creates a planner over the built-in compute instance schema.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the built-in schema is inconsistent.
    pub fn compute_instance() -> Result<Self, RegistryError> {
        AttributeRegistry::compute_instance().map(Self::new)
    }

    /// Returns the schema the planner evaluates against.
    #[must_use]
    pub const fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    /// Plans the transition from `observed` (absent for a new resource) to
    /// `desired`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Conflict`] when an immutable attribute changes
    /// and [`PlanError::Diff`] when an attachment list repeats a network.
    pub fn plan(
        &self,
        desired: &DesiredInstance,
        observed: Option<&InstanceRepresentation>,
    ) -> Result<Plan, PlanError> {
        let empty = Fields::new();
        let observed_fields = observed.map_or(&empty, |instance| &instance.fields);
        let context = if observed.is_some() {
            EvaluationContext::updating()
        } else {
            EvaluationContext::creating()
        };

        let names = desired
            .attributes
            .keys()
            .chain(observed_fields.keys())
            .filter(|name| name.as_str() != ID_FIELD)
            .collect::<BTreeSet<_>>();

        let mut attributes = BTreeMap::new();
        for name in names {
            let planned = evaluate(
                name,
                self.registry.policy_for(name),
                desired.attributes.get(name),
                observed_fields.get(name),
                context,
            )?;
            if let Some(value) = planned {
                attributes.insert(name.clone(), value);
            }
        }

        let observed_attachments = observed
            .map(InstanceRepresentation::attachment_specs)
            .unwrap_or_default();
        let changes = diff(&desired.attachments, &observed_attachments)?;

        let dirty = self
            .registry
            .dependencies()
            .dirty_fields(|dependency| match dependency {
                Dependency::AttachmentTopology => changes.has_changes(),
                Dependency::Attribute(name) => {
                    attribute_changed(&attributes, observed_fields, name)
                }
            });
        for field in dirty {
            let planned = evaluate(
                &field,
                self.registry.policy_for(&field),
                desired.attributes.get(&field),
                observed_fields.get(&field),
                context.with_dependency_changed(true),
            )?;
            match planned {
                Some(value) => attributes.insert(field, value),
                None => attributes.remove(&field),
            };
        }

        let sensitive = attributes
            .keys()
            .filter(|name| self.registry.is_sensitive(name))
            .cloned()
            .collect();

        Ok(Plan {
            creating: observed.is_none(),
            sensitive,
            attributes,
            attachments: desired.attachments.clone(),
            changes,
        })
    }
}

fn attribute_changed(
    attributes: &BTreeMap<String, PlannedValue>,
    observed: &Fields,
    name: &str,
) -> bool {
    match attributes.get(name) {
        Some(PlannedValue::Unresolved) => true,
        Some(PlannedValue::Known(value)) => observed.get(name) != Some(value),
        None => false,
    }
}
