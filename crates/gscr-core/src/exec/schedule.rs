//! Deterministic group ordering.
//!
//! Groups are topologically sorted over `depends_on`, with ties broken by
//! priority (smaller first) and then declaration order. The order is fully
//! deterministic, so two runs of the same config schedule identically.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::spec::GroupSpec;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("group `{group}` depends on unknown group `{dependency}`")]
    MissingDependency { group: String, dependency: String },

    #[error("dependency cycle among groups: {}", cycle.join(", "))]
    Cycle { cycle: Vec<String> },
}

impl ScheduleError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::MissingDependency { .. } => "group_missing_dependency",
            Self::Cycle { .. } => "group_cycle",
        }
    }
}

/// Kahn's algorithm returning indices into `groups` in execution order.
pub fn order_groups(groups: &[GroupSpec]) -> Result<Vec<usize>, ScheduleError> {
    let index: BTreeMap<&str, usize> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| (g.name.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; groups.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
    for (i, group) in groups.iter().enumerate() {
        for dep in &group.depends_on {
            let Some(&at) = index.get(dep.as_str()) else {
                return Err(ScheduleError::MissingDependency {
                    group: group.name.clone(),
                    dependency: dep.clone(),
                });
            };
            indegree[i] += 1;
            dependents[at].push(i);
        }
    }

    let mut ready: Vec<usize> = (0..groups.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(groups.len());
    while !ready.is_empty() {
        // Priority first, declaration index second.
        let pos = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, &i)| (groups[i].priority, i))
            .map(|(pos, _)| pos)
            .expect("ready set is non-empty");
        let next = ready.swap_remove(pos);
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != groups.len() {
        let mut cycle: Vec<String> = (0..groups.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| groups[i].name.clone())
            .collect();
        cycle.sort();
        return Err(ScheduleError::Cycle { cycle });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    fn groups(cfg: &str) -> Vec<GroupSpec> {
        load_config(cfg).unwrap().groups
    }

    fn names(groups: &[GroupSpec], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| groups[i].name.clone()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let gs = groups(
            r#"
            [[groups]]
            name = "deploy"
            depends_on = ["build"]
            [[groups]]
            name = "build"
            "#,
        );
        let order = order_groups(&gs).unwrap();
        assert_eq!(names(&gs, &order), vec!["build", "deploy"]);
    }

    #[test]
    fn priority_breaks_ties_then_declaration_order() {
        let gs = groups(
            r#"
            [[groups]]
            name = "c"
            priority = 5
            [[groups]]
            name = "a"
            priority = 1
            [[groups]]
            name = "b"
            priority = 1
            "#,
        );
        let order = order_groups(&gs).unwrap();
        assert_eq!(names(&gs, &order), vec!["a", "b", "c"]);
    }

    #[test]
    fn priority_yields_to_dependencies() {
        let gs = groups(
            r#"
            [[groups]]
            name = "late"
            priority = 0
            depends_on = ["early"]
            [[groups]]
            name = "early"
            priority = 99
            "#,
        );
        let order = order_groups(&gs).unwrap();
        assert_eq!(names(&gs, &order), vec!["early", "late"]);
    }

    #[test]
    fn cycle_reported_with_member_names() {
        // The loader rejects cycles too, so build the specs by hand.
        let mut gs = groups(
            r#"
            [[groups]]
            name = "a"
            [[groups]]
            name = "b"
            "#,
        );
        gs[0].depends_on = vec!["b".to_string()];
        gs[1].depends_on = vec!["a".to_string()];
        let err = order_groups(&gs).unwrap_err();
        match err {
            ScheduleError::Cycle { cycle } => {
                assert_eq!(cycle, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut gs = groups(
            r#"
            [[groups]]
            name = "a"
            "#,
        );
        gs[0].depends_on = vec!["ghost".to_string()];
        assert_eq!(
            order_groups(&gs).unwrap_err().tag(),
            "group_missing_dependency"
        );
    }
}
