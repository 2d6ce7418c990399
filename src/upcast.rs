//! Upcasting: rewriting historical event payloads to the current schema.
//!
//! Schema migrations are registered as edges `(family, from_version,
//! to_version, transform)`. At startup the builder compiles the flat
//! edge set into per-`(family, source_version)` chains that end at the
//! family's terminal version, validating the whole graph eagerly: after
//! [`SchemaRegistryBuilder::build`] succeeds, every historical type tag
//! the system can legally encounter resolves in O(1) to a chain and a
//! target constructor, and no validation happens on the read path.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::error::Error;
use crate::evt::{Envelope, StoredEnvelope, TypeTag};

//------------ Function types ------------------------------------------------

/// A pure transformation from one payload dict shape to the next.
///
/// Upcasters are instantiated once at registration and reused for every
/// subsequent transformation; they must be stateless.
pub type UpcastFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Builds the current event type from a (possibly upcast) payload dict.
pub type ConstructFn<E> = Arc<dyn Fn(Value) -> Result<E, serde_json::Error> + Send + Sync>;

//------------ SchemaRegistry ------------------------------------------------

struct CurrentEntry<E> {
    family: &'static str,
    construct: ConstructFn<E>,
    fact: bool,
}

struct Chain<E> {
    steps: Vec<UpcastFn>,
    construct: ConstructFn<E>,
}

/// The frozen schema tables for one aggregate type's events.
///
/// Two lookups cover every type tag that can legally appear in the log:
/// exact current-schema tags resolve to their constructor directly, and
/// old-schema tags resolve through a pre-compiled upcaster chain to the
/// *same* current constructor.
pub struct SchemaRegistry<E> {
    current: HashMap<TypeTag, CurrentEntry<E>>,
    chains: HashMap<(String, u32), Chain<E>>,
}

impl<E> std::fmt::Debug for SchemaRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("current", &self.current.len())
            .field("chains", &self.chains.len())
            .finish()
    }
}

impl<E> SchemaRegistry<E> {
    /// Decodes a stored envelope into a typed one.
    ///
    /// The current-schema case costs one table lookup and a payload
    /// decode; this is the dominant case for a live system. Anything
    /// else goes through the chain, and the constructed envelope keeps
    /// the original stored metadata so audit information about what was
    /// actually written is preserved.
    pub fn decode(&self, stored: &StoredEnvelope) -> Result<Envelope<E>, Error> {
        if let Some(entry) = self.current.get(stored.type_tag()) {
            let event = (entry.construct)(stored.payload().clone()).map_err(|source| {
                Error::EventDecode {
                    tag: stored.type_tag().clone(),
                    source,
                }
            })?;
            return Ok(Envelope::new(event, stored));
        }

        let tag = stored.type_tag();
        let chain = self
            .chains
            .get(&(tag.family().to_string(), tag.version()))
            .ok_or_else(|| Error::UnmappedTypeTag(tag.clone()))?;

        debug!(
            "upcasting envelope '{tag}' through {} step(s)",
            chain.steps.len()
        );
        let mut payload = stored.payload().clone();
        for step in &chain.steps {
            payload = step(payload);
        }
        let event = (chain.construct)(payload).map_err(|source| Error::EventDecode {
            tag: tag.clone(),
            source,
        })?;
        Ok(Envelope::new(event, stored))
    }

    /// Whether a non-fact event family is registered under this name.
    pub(crate) fn is_registered_event(&self, family: &str) -> bool {
        self.current
            .values()
            .any(|entry| entry.family == family && !entry.fact)
    }

    /// The registered non-fact event families.
    pub(crate) fn event_families(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.current
            .values()
            .filter(|entry| !entry.fact)
            .map(|entry| entry.family)
    }
}

//------------ SchemaRegistryBuilder -----------------------------------------

struct EventReg<E> {
    family: &'static str,
    version: u32,
    construct: ConstructFn<E>,
    fact: bool,
}

struct Edge {
    from: u32,
    to: u32,
    transform: UpcastFn,
}

/// Collects event and upcaster registrations and compiles them into a
/// [`SchemaRegistry`].
pub struct SchemaRegistryBuilder<E> {
    events: Vec<EventReg<E>>,
    edges: BTreeMap<String, Vec<Edge>>,
}

impl<E> SchemaRegistryBuilder<E> {
    pub fn new() -> Self {
        SchemaRegistryBuilder {
            events: Vec::new(),
            edges: BTreeMap::new(),
        }
    }

    pub fn event<C>(self, family: &'static str, version: u32, construct: C) -> Self
    where
        C: Fn(Value) -> Result<E, serde_json::Error> + Send + Sync + 'static,
    {
        self.register(family, version, construct, false)
    }

    pub fn fact_event<C>(self, family: &'static str, version: u32, construct: C) -> Self
    where
        C: Fn(Value) -> Result<E, serde_json::Error> + Send + Sync + 'static,
    {
        self.register(family, version, construct, true)
    }

    fn register<C>(mut self, family: &'static str, version: u32, construct: C, fact: bool) -> Self
    where
        C: Fn(Value) -> Result<E, serde_json::Error> + Send + Sync + 'static,
    {
        self.events.push(EventReg {
            family,
            version,
            construct: Arc::new(construct),
            fact,
        });
        self
    }

    pub fn upcaster<U>(mut self, family: &str, from: u32, to: u32, transform: U) -> Self
    where
        U: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.edges.entry(family.to_string()).or_default().push(Edge {
            from,
            to,
            transform: Arc::new(transform),
        });
        self
    }

    /// Compiles and validates the registration.
    ///
    /// Checks, per family: no two edges share a source version; the
    /// edges converge on exactly one terminal version; the terminal
    /// corresponds to a registered current type tag; every source
    /// version has an acyclic, gap-free walk to the terminal. Any
    /// failure is a configuration error and must abort startup.
    pub fn build(self) -> Result<SchemaRegistry<E>, Error> {
        let mut current = HashMap::new();
        let mut families: HashMap<&'static str, (u32, ConstructFn<E>)> = HashMap::new();

        for reg in self.events {
            if families.contains_key(reg.family) {
                return Err(Error::DuplicateEvent {
                    family: reg.family.to_string(),
                });
            }
            families.insert(reg.family, (reg.version, reg.construct.clone()));
            current.insert(
                TypeTag::new(reg.family, reg.version),
                CurrentEntry {
                    family: reg.family,
                    construct: reg.construct,
                    fact: reg.fact,
                },
            );
        }

        let mut chains = HashMap::new();
        for (family, edges) in self.edges {
            let mut adjacency: BTreeMap<u32, (u32, UpcastFn)> = BTreeMap::new();
            for edge in edges {
                if adjacency
                    .insert(edge.from, (edge.to, edge.transform))
                    .is_some()
                {
                    return Err(Error::AmbiguousMigration {
                        family,
                        from: edge.from,
                    });
                }
            }

            let sources: BTreeSet<u32> = adjacency.keys().copied().collect();
            let targets: BTreeSet<u32> = adjacency.values().map(|(to, _)| *to).collect();
            let terminals: Vec<u32> = targets.difference(&sources).copied().collect();
            let terminal = if terminals.is_empty() {
                // Every target is also a source: in a finite edge set
                // that means the graph contains a cycle.
                return Err(Error::MigrationCycle { family });
            } else if let [terminal] = terminals.as_slice() {
                *terminal
            } else {
                return Err(Error::NonConvergentSchema { family, terminals });
            };

            let construct = match families.get(family.as_str()) {
                Some((version, construct)) if *version == terminal => construct.clone(),
                _ => return Err(Error::MissingTerminal { family, terminal }),
            };

            for &from in &sources {
                let mut steps = Vec::new();
                let mut visited = HashSet::from([from]);
                let mut at = from;
                while at != terminal {
                    let Some((to, transform)) = adjacency.get(&at) else {
                        return Err(Error::MigrationGap {
                            family,
                            from,
                            stalled_at: at,
                        });
                    };
                    steps.push(transform.clone());
                    at = *to;
                    if !visited.insert(at) {
                        return Err(Error::MigrationCycle { family });
                    }
                }
                chains.insert(
                    (family.clone(), from),
                    Chain {
                        steps,
                        construct: construct.clone(),
                    },
                );
            }
        }

        Ok(SchemaRegistry { current, chains })
    }
}

impl<E> Default for SchemaRegistryBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

//------------ Tests ---------------------------------------------------------
