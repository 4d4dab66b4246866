//! Outcome of one janitor sweep.

/// What a sweep deleted, kept and failed on. Entries are subvolume names,
/// `{container}/{namespace}` for zdb namespaces and `zdb:{container}` for
/// torn down zdb containers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    /// Failures the sweep continued past.
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn merge(&mut self, other: Self) {
        self.deleted.extend(other.deleted);
        self.kept.extend(other.kept);
        self.errors.extend(other.errors);
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn error(&mut self, message: String) {
        self.errors.push(message);
    }
}
