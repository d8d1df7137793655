use crate::settings::CONTROL_PREFIX;
use crate::CoreError;
use serde::Serialize;
use stackup_schema::{Environment, ReferenceSet};
use tracing::warn;

/// Cross-check of the Environment against the stack definition's references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Referenced on a live line but not defined. Fatal.
    pub undefined: Vec<String>,
    /// Referenced only on commented lines and not defined.
    pub commented_undefined: Vec<String>,
    /// Defined but never referenced, control variables excluded.
    pub unused: Vec<String>,
}

impl ReconcileReport {
    pub fn warnings(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .commented_undefined
            .iter()
            .map(|k| format!("{k} is referenced only in commented lines and is not defined"))
            .collect();
        if !self.unused.is_empty() {
            out.push(format!(
                "defined but not referenced by the stack: {}",
                self.unused.join(", ")
            ));
        }
        out
    }

    pub fn into_result(self) -> Result<Self, CoreError> {
        if self.undefined.is_empty() {
            Ok(self)
        } else {
            Err(CoreError::UndefinedReference {
                keys: self.undefined,
            })
        }
    }
}

/// Compare `env` with `refs`. A key that is present with an empty value
/// counts as defined.
pub fn reconcile(env: &Environment, refs: &ReferenceSet) -> ReconcileReport {
    let report = ReconcileReport {
        undefined: refs
            .active
            .iter()
            .filter(|k| !env.contains_key(k))
            .cloned()
            .collect(),
        commented_undefined: refs
            .commented
            .iter()
            .filter(|k| !env.contains_key(k))
            .cloned()
            .collect(),
        unused: env
            .keys()
            .filter(|k| !k.starts_with(CONTROL_PREFIX))
            .filter(|k| !refs.active.contains(*k) && !refs.commented.contains(*k))
            .map(str::to_owned)
            .collect(),
    };

    for w in report.warnings() {
        warn!("{w}");
    }
    report
}
