use std::collections::HashSet;

use anyhow::bail;

/// Per-user IP ceilings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LimitConfig {
    general_limit: usize,
    overrides: Vec<(String, usize)>,
    exceptions: HashSet<String>,
}

impl LimitConfig {
    /// Fails if `overrides` names the same user more than once.
    pub(crate) fn new(
        general_limit: usize,
        overrides: Vec<(String, usize)>,
        exceptions: HashSet<String>,
    ) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for (user, _) in &overrides {
            if !seen.insert(user.as_str()) {
                bail!("User {user:?} has more than one special limit");
            }
        }

        Ok(Self {
            general_limit,
            overrides,
            exceptions,
        })
    }

    pub(crate) fn limit_for(&self, user: &str) -> usize {
        self.overrides
            .iter()
            .find(|(name, _)| name == user)
            .map_or(self.general_limit, |&(_, limit)| limit)
    }

    pub(crate) fn is_exempt(&self, user: &str) -> bool {
        self.exceptions.contains(user)
    }
}

/// Everything the engine needs for one cycle, re-read from config each time.
#[derive(Clone, Debug)]
pub(crate) struct LimitSettings {
    pub(crate) limits: LimitConfig,
    /// Consecutive over-limit cycles before a user is disabled.
    pub(crate) out_of_limit_threshold: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_general_limit() {
        let limits = LimitConfig::new(2, vec![("vip".to_owned(), 5)], HashSet::new()).unwrap();

        assert_eq!(limits.limit_for("vip"), 5);
        assert_eq!(limits.limit_for("anyone"), 2);
    }

    #[test]
    fn duplicate_overrides_rejected() {
        let result = LimitConfig::new(
            2,
            vec![("vip".to_owned(), 5), ("vip".to_owned(), 7)],
            HashSet::new(),
        );

        assert!(result.is_err());
    }

    #[test]
    fn exceptions() {
        let limits = LimitConfig::new(2, Vec::new(), HashSet::from(["admin".to_owned()])).unwrap();

        assert!(limits.is_exempt("admin"));
        assert!(!limits.is_exempt("alice"));
    }
}
