//! Static attribute schema: policy per attribute plus dependency edges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use super::Policy;

/// What a derived attribute depends on.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Dependency {
    /// Another attribute of the same resource.
    Attribute(String),
    /// The set of network attachments.
    AttachmentTopology,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(name) => write!(f, "attribute '{name}'"),
            Self::AttachmentTopology => f.write_str("attachment topology"),
        }
    }
}

/// A single `field depends on dependency` edge.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependencyEdge {
    /// Derived attribute.
    pub field: String,
    /// What it is derived from.
    pub depends_on: Dependency,
}

/// Explicit dependency edge list, walked once per cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DependencyGraph {
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Returns the registered edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Returns every field whose dependencies changed, directly or through
    /// other derived attributes.
    ///
    /// `changed` reports whether a dependency changed in this cycle. A field
    /// that becomes dirty is itself treated as a changed
    /// [`Dependency::Attribute`] for the remaining edges.
    pub fn dirty_fields(&self, changed: impl Fn(&Dependency) -> bool) -> BTreeSet<String> {
        let mut dirty = BTreeSet::new();
        loop {
            let before = dirty.len();
            for edge in &self.edges {
                if dirty.contains(&edge.field) {
                    continue;
                }
                let propagated = match &edge.depends_on {
                    Dependency::Attribute(name) => dirty.contains(name),
                    Dependency::AttachmentTopology => false,
                };
                if propagated || changed(&edge.depends_on) {
                    dirty.insert(edge.field.clone());
                }
            }
            if dirty.len() == before {
                return dirty;
            }
        }
    }
}

/// Errors raised while building an [`AttributeRegistry`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when a dependency edge targets an attribute that is not derived.
    #[error("attribute '{field}' has policy {policy}; only recompute-on-change attributes may declare dependencies")]
    DependentNotDerived {
        /// Field the edge was declared for.
        field: String,
        /// Policy the field is registered with.
        policy: Policy,
    },
    /// Raised when an edge names an attribute the registry does not know.
    #[error("attribute '{field}' depends on unknown attribute '{dependency}'")]
    UnknownDependency {
        /// Field the edge was declared for.
        field: String,
        /// Missing attribute.
        dependency: String,
    },
}

/// Mapping from attribute name to policy plus the dependency graph.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttributeRegistry {
    policies: BTreeMap<String, Policy>,
    dependencies: DependencyGraph,
    sensitive: BTreeSet<String>,
}

impl AttributeRegistry {
    /// Creates an empty registry in which every attribute is
    /// [`Policy::Mutable`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the policy for an attribute, replacing any previous one.
    #[must_use]
    pub fn with_policy(mut self, attribute: impl Into<String>, policy: Policy) -> Self {
        self.policies.insert(attribute.into(), policy);
        self
    }

    /// Marks an attribute whose value must not be displayed.
    #[must_use]
    pub fn with_sensitive(mut self, attribute: impl Into<String>) -> Self {
        self.sensitive.insert(attribute.into());
        self
    }

    /// Returns `true` when `attribute` holds a secret.
    #[must_use]
    pub fn is_sensitive(&self, attribute: &str) -> bool {
        self.sensitive.contains(attribute)
    }

    /// Declares that `field` is derived from `depends_on`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DependentNotDerived`] when `field` is not
    /// registered as [`Policy::RecomputeOnChange`], or
    /// [`RegistryError::UnknownDependency`] when an attribute dependency is
    /// not registered.
    pub fn with_dependency(
        mut self,
        field: impl Into<String>,
        depends_on: Dependency,
    ) -> Result<Self, RegistryError> {
        let name = field.into();
        let policy = self.policy_for(&name);
        if policy != Policy::RecomputeOnChange {
            return Err(RegistryError::DependentNotDerived {
                field: name,
                policy,
            });
        }
        if let Dependency::Attribute(dependency) = &depends_on
            && !self.policies.contains_key(dependency)
        {
            return Err(RegistryError::UnknownDependency {
                field: name,
                dependency: dependency.clone(),
            });
        }
        self.dependencies.edges.push(DependencyEdge {
            field: name,
            depends_on,
        });
        Ok(self)
    }

    /// Returns the policy governing `attribute`, defaulting to
    /// [`Policy::Mutable`] for unregistered names.
    #[must_use]
    pub fn policy_for(&self, attribute: &str) -> Policy {
        self.policies.get(attribute).copied().unwrap_or_default()
    }

    /// Iterates over registered attribute names.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Returns the dependency graph.
    #[must_use]
    pub const fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    /// Schema for a compute instance with network attachments.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the built-in edges are inconsistent with
    /// the built-in policies.
    pub fn compute_instance() -> Result<Self, RegistryError> {
        let registry = [
            ("image_id", Policy::Immutable),
            ("availability_zone", Policy::Immutable),
            ("key_pair", Policy::IgnoreAfterCreate),
            ("user_data", Policy::IgnoreAfterCreate),
            ("admin_password", Policy::IgnoreAfterCreate),
            ("access_ipv4", Policy::RecomputeOnChange),
            ("access_ipv6", Policy::RecomputeOnChange),
            ("description", Policy::PreserveUnlessExplicit),
            ("name", Policy::Mutable),
            ("flavor", Policy::Mutable),
            ("metadata", Policy::Mutable),
            ("tags", Policy::Mutable),
        ]
        .into_iter()
        .fold(Self::new(), |schema, (attribute, policy)| {
            schema.with_policy(attribute, policy)
        });

        registry
            .with_sensitive("admin_password")
            .with_sensitive("user_data")
            .with_dependency("access_ipv4", Dependency::AttachmentTopology)?
            .with_dependency("access_ipv6", Dependency::AttachmentTopology)
    }
}
