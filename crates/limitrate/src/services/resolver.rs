//! Policy resolution: `(plan, endpoint-key)` to the applicable
//! [`EndpointPolicy`].
//!
//! The whole plan tree is compiled once at construction into per-plan
//! lookup tables: exact endpoint keys in a hash map for O(1) matches, and
//! templated keys (`{param}` placeholders) as compiled regexes tried in
//! specificity order. Resolution is winner-takes-all: an endpoint match is
//! returned as-is, never merged with the plan's defaults. This keeps the
//! effective policy for any request explainable from a single table row.

use crate::models::error::LimitError;
use crate::models::policy::{EndpointPolicy, PlanPolicy};
use crate::utils::pattern::{self, CompiledPattern};
use ahash::HashMap as AHashMap;
use log::debug;
use std::collections::HashMap;

/// A templated endpoint entry compiled for raw-path matching.
#[derive(Debug, Clone)]
struct CompiledEndpoint {
    pattern: CompiledPattern,
    policy: EndpointPolicy,
}

/// One plan's lookup tables.
#[derive(Debug, Clone, Default)]
struct PlanTable {
    exact: AHashMap<String, EndpointPolicy>,
    /// Sorted fewest-placeholders-first, so more specific templates win.
    templated: Vec<CompiledEndpoint>,
    defaults: Option<EndpointPolicy>,
}

/// Immutable, compiled policy snapshot.
///
/// Captured at middleware construction; resolution afterwards is a pure
/// function of `(plan, endpoint-key)`.
#[derive(Debug, Clone)]
pub struct PolicySet {
    plans: AHashMap<String, PlanTable>,
    base_plan: String,
    empty: EndpointPolicy,
}

impl PolicySet {
    /// Compiles the plan tree. Fails with [`LimitError::Config`] when a
    /// policy is structurally invalid or a templated key does not compile.
    pub fn new(plans: &HashMap<String, PlanPolicy>, base_plan: &str) -> Result<Self, LimitError> {
        let mut compiled_plans = AHashMap::default();
        for (name, plan) in plans {
            plan.validate()
                .map_err(|e| LimitError::Config(format!("plan '{}': {}", name, e)))?;

            let mut table = PlanTable {
                defaults: plan.defaults.clone(),
                ..PlanTable::default()
            };
            for (key, policy) in &plan.endpoints {
                if pattern::is_dynamic(key) {
                    let compiled = pattern::compile(key).map_err(|e| {
                        LimitError::Config(format!("plan '{}', endpoint '{}': {}", name, key, e))
                    })?;
                    table.templated.push(CompiledEndpoint {
                        pattern: compiled,
                        policy: policy.clone(),
                    });
                } else {
                    table.exact.insert(key.clone(), policy.clone());
                }
            }
            table
                .templated
                .sort_by_key(|entry| entry.pattern.param_count);
            compiled_plans.insert(name.clone(), table);
        }

        if !plans.is_empty() && !plans.contains_key(base_plan) {
            debug!(
                "base plan '{}' has no policy entry; unknown plans resolve to the empty policy",
                base_plan
            );
        }

        Ok(Self {
            plans: compiled_plans,
            base_plan: base_plan.to_string(),
            empty: EndpointPolicy::empty(),
        })
    }

    /// True when the plan name has its own policy entry.
    pub fn known_plan(&self, plan: &str) -> bool {
        self.plans.contains_key(plan)
    }

    /// Resolves the policy for `(plan, endpoint_key)`.
    ///
    /// Unknown plans collapse to the base plan. Within the plan, an exact
    /// endpoint match wins, then the most specific templated match, then
    /// the plan's defaults, then the empty (unlimited) policy.
    pub fn resolve(&self, plan: &str, endpoint_key: &str) -> &EndpointPolicy {
        let table = match self.plans.get(plan).or_else(|| self.plans.get(&self.base_plan)) {
            Some(table) => table,
            None => return &self.empty,
        };

        if let Some(policy) = table.exact.get(endpoint_key) {
            return policy;
        }
        for entry in &table.templated {
            if entry.pattern.regex.is_match(endpoint_key) {
                return &entry.policy;
            }
        }
        table.defaults.as_ref().unwrap_or(&self.empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{Action, RatePolicy};

    fn rate(limit: u64) -> EndpointPolicy {
        EndpointPolicy {
            rate: Some(RatePolicy {
                max_per_minute: Some(limit),
                max_per_hour: None,
                max_per_day: None,
                action_on_exceed: Action::Block,
                slowdown_ms: None,
            }),
            cost: None,
        }
    }

    fn plan_set() -> HashMap<String, PlanPolicy> {
        let mut free_endpoints = HashMap::new();
        free_endpoints.insert("POST|/api/ask".to_string(), rate(10));
        free_endpoints.insert("GET|/users/{id}".to_string(), rate(30));

        let mut plans = HashMap::new();
        plans.insert(
            "free".to_string(),
            PlanPolicy {
                endpoints: free_endpoints,
                defaults: Some(rate(60)),
            },
        );
        plans.insert(
            "pro".to_string(),
            PlanPolicy {
                endpoints: HashMap::new(),
                defaults: None,
            },
        );
        plans
    }

    #[test]
    fn exact_endpoint_match_wins() {
        let set = PolicySet::new(&plan_set(), "free").unwrap();
        let policy = set.resolve("free", "POST|/api/ask");
        assert_eq!(policy.rate.as_ref().unwrap().max_per_minute, Some(10));
    }

    #[test]
    fn templated_key_matches_raw_path() {
        let set = PolicySet::new(&plan_set(), "free").unwrap();
        let policy = set.resolve("free", "GET|/users/42");
        assert_eq!(policy.rate.as_ref().unwrap().max_per_minute, Some(30));
    }

    #[test]
    fn falls_back_to_plan_defaults_without_merging() {
        let set = PolicySet::new(&plan_set(), "free").unwrap();
        let policy = set.resolve("free", "GET|/api/other");
        assert_eq!(policy.rate.as_ref().unwrap().max_per_minute, Some(60));
        // Winner-takes-all: the endpoint entry's cost axis is absent and
        // stays absent; nothing leaks in from defaults.
        assert!(set.resolve("free", "POST|/api/ask").cost.is_none());
    }

    #[test]
    fn unknown_plan_collapses_to_base_plan() {
        let set = PolicySet::new(&plan_set(), "free").unwrap();
        let policy = set.resolve("trial-2024", "POST|/api/ask");
        assert_eq!(policy.rate.as_ref().unwrap().max_per_minute, Some(10));
    }

    #[test]
    fn plan_without_policies_is_unlimited() {
        let set = PolicySet::new(&plan_set(), "free").unwrap();
        assert!(set.resolve("pro", "POST|/api/ask").is_unlimited());
    }

    #[test]
    fn empty_tree_resolves_to_empty_policy() {
        let set = PolicySet::new(&HashMap::new(), "free").unwrap();
        assert!(set.resolve("free", "GET|/x").is_unlimited());
    }

    #[test]
    fn invalid_template_is_a_config_error() {
        let mut plans = HashMap::new();
        let mut endpoints = HashMap::new();
        endpoints.insert("GET|/users/{".to_string(), rate(1));
        plans.insert(
            "free".to_string(),
            PlanPolicy {
                endpoints,
                defaults: None,
            },
        );
        assert!(matches!(
            PolicySet::new(&plans, "free"),
            Err(LimitError::Config(_))
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let plans = plan_set();
        let set_a = PolicySet::new(&plans, "free").unwrap();
        let set_b = PolicySet::new(&plans, "free").unwrap();
        for (plan, key) in [
            ("free", "POST|/api/ask"),
            ("free", "GET|/users/7"),
            ("pro", "GET|/anything"),
            ("ghost", "POST|/api/ask"),
        ] {
            assert_eq!(set_a.resolve(plan, key), set_b.resolve(plan, key));
        }
    }
}
