//! Human-readable rendering of a [`Plan`].

use std::fmt;

use crate::remote::Fields;

use super::Plan;

const SENSITIVE: &str = "(sensitive)";

/// Renders a plan against the observed fields it was computed from.
#[derive(Clone, Copy, Debug)]
pub struct PlanReport<'a> {
    plan: &'a Plan,
    observed: &'a Fields,
}

impl<'a> PlanReport<'a> {
    /// Creates a report for `plan`; pass empty fields for a new resource.
    #[must_use]
    pub const fn new(plan: &'a Plan, observed: &'a Fields) -> Self {
        Self { plan, observed }
    }
}

impl fmt::Display for PlanReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.plan.creating {
            writeln!(f, "+ create instance")?;
            for (name, value) in &self.plan.attributes {
                if self.plan.sensitive.contains(name) {
                    writeln!(f, "    {name} = {SENSITIVE}")?;
                } else {
                    writeln!(f, "    {name} = {value}")?;
                }
            }
            for attachment in &self.plan.attachments {
                writeln!(f, "    + attach {}", attachment.network_id)?;
            }
            return Ok(());
        }

        if self.plan.is_noop(self.observed) {
            return writeln!(f, "= no changes");
        }

        writeln!(f, "~ update instance")?;
        for (name, value) in self.plan.changed_fields(self.observed) {
            if self.plan.sensitive.contains(&name) {
                writeln!(f, "    {name}: {SENSITIVE}")?;
                continue;
            }
            let previous = self
                .observed
                .get(&name)
                .map_or_else(|| String::from("(unset)"), ToString::to_string);
            writeln!(f, "    {name}: {previous} -> {value}")?;
        }
        for name in self.plan.unresolved() {
            writeln!(f, "    {name}: (known after apply)")?;
        }
        let changes = &self.plan.changes;
        for key in changes.delete.keys() {
            writeln!(f, "    - detach {key}")?;
        }
        for key in changes.create.keys() {
            writeln!(f, "    + attach {key}")?;
        }
        for (key, update) in &changes.update {
            writeln!(
                f,
                "    ~ update {key} ({})",
                update.delta.changed_fields().join(", ")
            )?;
        }
        Ok(())
    }
}
