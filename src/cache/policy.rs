//! Cache policies, invalidation rules and the policy registry.
//!
//! Entries carry only a policy *name*; TTL, byte budget and rules are looked
//! up here on every write and every read, so re-registering a policy
//! reclassifies entries that already reference it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::entry::Clock;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const MIB: usize = 1024 * 1024;

/// What has to happen for a rule to fire, with its trigger-specific condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    /// The entry is older than `after_ms`.
    TimeElapsed { after_ms: u64 },
    /// The named dependency changed after the entry was stored.
    DependencyChanged { dependency: String },
    /// The user performed the named action after the entry was stored.
    UserAction { action: String },
    /// The network is currently flagged as degraded.
    DegradedNetwork,
}

/// What a matching rule does to the read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Treat as a miss and delete.
    Invalidate,
    /// Like `Invalidate`, and go straight to the origin for a fresh value.
    Refresh,
    /// Serve the value anyway, marked stale.
    DegradeToStale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRule {
    #[serde(flatten)]
    pub trigger: Trigger,
    pub action: RuleAction,
}

impl InvalidationRule {
    pub fn new(trigger: Trigger, action: RuleAction) -> Self {
        Self { trigger, action }
    }
}

/// A named cache policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub name: String,

    /// Lower numbers are more important; under global memory pressure the
    /// largest numbers are evicted first.
    pub priority: u32,

    pub ttl_ms: u64,

    /// Memory-tier byte budget for entries tagged with this policy.
    pub max_bytes: usize,

    #[serde(default)]
    pub invalidation_rules: Vec<InvalidationRule>,
}

impl CachePolicy {
    pub fn new(name: impl Into<String>, priority: u32, ttl_ms: u64, max_bytes: usize) -> Self {
        Self {
            name: name.into(),
            priority,
            ttl_ms,
            max_bytes,
            invalidation_rules: Vec::new(),
        }
    }

    /// Last millisecond at which an entry stored at `stored_at` is valid.
    pub fn expires_at(&self, stored_at: u64) -> u64 {
        stored_at.saturating_add(self.ttl_ms)
    }

    pub fn with_rule(mut self, trigger: Trigger, action: RuleAction) -> Self {
        self.invalidation_rules.push(InvalidationRule::new(trigger, action));
        self
    }

    /// The policies the companion app ships with.
    pub fn defaults() -> Vec<CachePolicy> {
        vec![
            CachePolicy::new("user_preferences", 1, 24 * HOUR_MS, 10 * MIB)
                .with_rule(
                    Trigger::UserAction {
                        action: "preference_change".into(),
                    },
                    RuleAction::Invalidate,
                )
                .with_rule(
                    Trigger::TimeElapsed {
                        after_ms: 24 * HOUR_MS,
                    },
                    RuleAction::Refresh,
                ),
            CachePolicy::new("conversations", 2, 6 * HOUR_MS, 50 * MIB)
                .with_rule(
                    Trigger::DependencyChanged {
                        dependency: "new_message".into(),
                    },
                    RuleAction::Refresh,
                )
                .with_rule(
                    Trigger::TimeElapsed {
                        after_ms: 6 * HOUR_MS,
                    },
                    RuleAction::Refresh,
                ),
            CachePolicy::new("suggestions", 3, 2 * HOUR_MS, 20 * MIB)
                .with_rule(
                    Trigger::TimeElapsed {
                        after_ms: 2 * HOUR_MS,
                    },
                    RuleAction::Refresh,
                )
                .with_rule(Trigger::DegradedNetwork, RuleAction::DegradeToStale),
            CachePolicy::new("predictive", 4, 30 * MINUTE_MS, 5 * MIB),
            CachePolicy::new("default", 5, HOUR_MS, 10 * MIB),
        ]
    }
}

/// Outcome of validating an entry against its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Fresh,
    /// Serve, but flag as stale.
    Stale,
    /// Drop the entry. `refresh` asks for an eager origin re-fetch.
    Invalid { refresh: bool },
}

/// Context the rules are evaluated against.
///
/// Dependency changes and user actions are timestamped: a rule only matches
/// entries stored *before* the event.
pub struct InvalidationSignals {
    clock: Arc<dyn Clock>,
    dependencies: RwLock<HashMap<String, u64>>,
    user_actions: RwLock<HashMap<String, u64>>,
    network_degraded: AtomicBool,
}

impl InvalidationSignals {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            dependencies: RwLock::new(HashMap::new()),
            user_actions: RwLock::new(HashMap::new()),
            network_degraded: AtomicBool::new(false),
        }
    }

    pub fn mark_dependency_changed(&self, dependency: &str) {
        let now = self.clock.now_ms();
        debug!(dependency, at = now, "Dependency changed");
        self.dependencies.write().insert(dependency.to_string(), now);
    }

    pub fn record_user_action(&self, action: &str) {
        let now = self.clock.now_ms();
        debug!(action, at = now, "User action recorded");
        self.user_actions.write().insert(action.to_string(), now);
    }

    pub fn set_network_degraded(&self, degraded: bool) {
        let was = self.network_degraded.swap(degraded, Ordering::AcqRel);
        if was != degraded {
            info!(degraded, "Network condition changed");
        }
    }

    pub fn is_network_degraded(&self) -> bool {
        self.network_degraded.load(Ordering::Acquire)
    }

    fn dependency_changed_since(&self, dependency: &str, stored_at: u64) -> bool {
        self.dependencies
            .read()
            .get(dependency)
            .is_some_and(|&changed_at| changed_at > stored_at)
    }

    fn user_action_since(&self, action: &str, stored_at: u64) -> bool {
        self.user_actions
            .read()
            .get(action)
            .is_some_and(|&at| at > stored_at)
    }

    fn matches(&self, trigger: &Trigger, stored_at: u64, now: u64) -> bool {
        match trigger {
            Trigger::TimeElapsed { after_ms } => now.saturating_sub(stored_at) > *after_ms,
            Trigger::DependencyChanged { dependency } => {
                self.dependency_changed_since(dependency, stored_at)
            }
            Trigger::UserAction { action } => self.user_action_since(action, stored_at),
            Trigger::DegradedNetwork => self.is_network_degraded(),
        }
    }

    /// Validate an entry stored at `stored_at` under `policy`.
    ///
    /// TTL expiry always invalidates. Among matching rules, `Invalidate` and
    /// `Refresh` win over `DegradeToStale`.
    pub fn validate(&self, policy: &CachePolicy, stored_at: u64, now: u64) -> Validation {
        if now > policy.expires_at(stored_at) {
            return Validation::Invalid { refresh: false };
        }

        let mut invalid = false;
        let mut refresh = false;
        let mut stale = false;

        for rule in &policy.invalidation_rules {
            if !self.matches(&rule.trigger, stored_at, now) {
                continue;
            }
            match rule.action {
                RuleAction::Invalidate => invalid = true,
                RuleAction::Refresh => {
                    invalid = true;
                    refresh = true;
                }
                RuleAction::DegradeToStale => stale = true,
            }
        }

        if invalid {
            Validation::Invalid { refresh }
        } else if stale {
            Validation::Stale
        } else {
            Validation::Fresh
        }
    }
}

/// Registry of named policies.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<CachePolicy>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with [`CachePolicy::defaults`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for policy in CachePolicy::defaults() {
            registry.register(policy);
        }
        registry
    }

    /// Register a policy, replacing any policy with the same name.
    pub fn register(&self, policy: CachePolicy) {
        info!(
            policy = %policy.name,
            priority = policy.priority,
            ttl_ms = policy.ttl_ms,
            max_bytes = policy.max_bytes,
            rules = policy.invalidation_rules.len(),
            "Registered cache policy"
        );
        self.policies
            .write()
            .insert(policy.name.clone(), Arc::new(policy));
    }

    pub fn get(&self, name: &str) -> Option<Arc<CachePolicy>> {
        self.policies.read().get(name).cloned()
    }

    /// Policy names, least important (highest priority number) first.
    pub fn names_by_eviction_order(&self) -> Vec<String> {
        let policies = self.policies.read();
        let mut all: Vec<&Arc<CachePolicy>> = policies.values().collect();
        all.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        all.into_iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}
