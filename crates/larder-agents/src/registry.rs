use crate::agent::AgentInstance;
use crate::descriptor::{AgentDescriptor, AgentOverrides};
use larder_core::{LarderError, LarderResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Collects descriptors and intent mappings, then validates them all at once.
#[derive(Default)]
pub struct AgentRegistryBuilder {
    descriptors: Vec<AgentDescriptor>,
    intents: Vec<(String, String)>,
    default_agent: Option<String>,
}

impl AgentRegistryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor.
    pub fn register(mut self, descriptor: AgentDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Route `intent` to `agent` (name or alias).
    pub fn map_intent(mut self, intent: impl Into<String>, agent: impl Into<String>) -> Self {
        self.intents.push((intent.into(), agent.into()));
        self
    }

    /// Agent used for unmapped intents and for direct dispatch.
    pub fn default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = Some(agent.into());
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Duplicate canonical names, duplicate aliases, aliases that shadow
    /// another agent's canonical name, and mappings to unknown agents are
    /// all configuration errors. Nothing is ever overwritten.
    pub fn build(self) -> LarderResult<AgentRegistry> {
        let mut by_name: HashMap<String, Arc<AgentDescriptor>> = HashMap::new();
        let mut order = Vec::with_capacity(self.descriptors.len());

        for descriptor in self.descriptors {
            descriptor.validate()?;
            let key = fold(&descriptor.name);
            if by_name.contains_key(&key) {
                return Err(LarderError::Configuration(format!(
                    "agent '{}' is registered twice",
                    descriptor.name
                )));
            }
            order.push(key.clone());
            by_name.insert(key, Arc::new(descriptor));
        }

        let mut aliases: HashMap<String, String> = HashMap::new();
        for key in &order {
            let Some(descriptor) = by_name.get(key) else {
                continue;
            };
            for alias in &descriptor.aliases {
                let folded = fold(alias);
                if folded == *key {
                    continue;
                }
                if by_name.contains_key(&folded) {
                    return Err(LarderError::Configuration(format!(
                        "alias '{alias}' of agent '{}' collides with the agent named '{alias}'",
                        descriptor.name
                    )));
                }
                if let Some(owner) = aliases.get(&folded) {
                    return Err(LarderError::Configuration(format!(
                        "alias '{alias}' is claimed by both '{owner}' and '{}'",
                        descriptor.name
                    )));
                }
                aliases.insert(folded, key.clone());
            }
        }

        let lookup = |name: &str| -> Option<String> {
            let folded = fold(name);
            if by_name.contains_key(&folded) {
                Some(folded)
            } else {
                aliases.get(&folded).cloned()
            }
        };

        let mut intents = HashMap::new();
        for (intent, agent) in &self.intents {
            let target = lookup(agent).ok_or_else(|| {
                LarderError::Configuration(format!(
                    "intent '{intent}' maps to unknown agent '{agent}'"
                ))
            })?;
            if intents.insert(fold(intent), target).is_some() {
                return Err(LarderError::Configuration(format!(
                    "intent '{intent}' is mapped twice"
                )));
            }
        }

        let default_agent = match &self.default_agent {
            Some(agent) => Some(lookup(agent).ok_or_else(|| {
                LarderError::Configuration(format!("default agent '{agent}' is not registered"))
            })?),
            None => None,
        };

        info!(
            agents = by_name.len(),
            aliases = aliases.len(),
            intents = intents.len(),
            "Agent registry built"
        );

        Ok(AgentRegistry {
            by_name,
            aliases,
            intents,
            default_agent,
        })
    }
}

/// Immutable, case-insensitive mapping from agent name or alias to descriptor.
#[derive(Debug)]
pub struct AgentRegistry {
    by_name: HashMap<String, Arc<AgentDescriptor>>,
    aliases: HashMap<String, String>,
    intents: HashMap<String, String>,
    default_agent: Option<String>,
}

impl AgentRegistry {
    /// Start building a registry.
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::new()
    }

    /// Canonical name first, then aliases.
    pub fn resolve(&self, name: &str) -> LarderResult<Arc<AgentDescriptor>> {
        let folded = fold(name);
        let key = if self.by_name.contains_key(&folded) {
            &folded
        } else {
            self.aliases
                .get(&folded)
                .ok_or_else(|| LarderError::NotFound(format!("agent '{name}'")))?
        };
        self.by_name
            .get(key)
            .cloned()
            .ok_or_else(|| LarderError::NotFound(format!("agent '{name}'")))
    }

    /// Agent for `intent`, falling back to the default agent.
    pub fn resolve_intent(&self, intent: &str) -> LarderResult<Arc<AgentDescriptor>> {
        let key = self
            .intents
            .get(&fold(intent))
            .or(self.default_agent.as_ref())
            .ok_or_else(|| {
                LarderError::NotFound(format!("no agent for intent '{intent}' and no default agent"))
            })?;
        self.resolve(key)
    }

    /// Canonical name of the default agent, if one was configured.
    pub fn default_agent(&self) -> Option<Arc<AgentDescriptor>> {
        self.default_agent
            .as_ref()
            .and_then(|key| self.by_name.get(key).cloned())
    }

    /// Resolve `name` and build an instance with `overrides` applied.
    pub fn construct(&self, name: &str, overrides: AgentOverrides) -> LarderResult<AgentInstance> {
        let descriptor = self.resolve(name)?;
        AgentInstance::construct(&descriptor, overrides)
    }

    /// Descriptors sorted by canonical name.
    pub fn descriptors(&self) -> Vec<Arc<AgentDescriptor>> {
        let mut all: Vec<_> = self.by_name.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// `(intent, canonical agent)` pairs sorted by intent.
    pub fn intents(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .intents
            .iter()
            .filter_map(|(intent, key)| {
                self.by_name
                    .get(key)
                    .map(|d| (intent.clone(), d.name.clone()))
            })
            .collect();
        all.sort();
        all
    }

    /// Whether `name` resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Registered agents.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// No agents registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}
