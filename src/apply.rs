//! The apply engine: the single authority for mutating aggregate state.
//!
//! Live mutation and historical replay converge on one set of per-family
//! mutation handlers. The two paths differ only in their bookkeeping:
//! the live path increments the version *before* the handler runs,
//! checks invariants around the mutation and appends the event to the
//! pending list; the replay path runs the handler first, increments
//! *after*, and checks nothing. Either way the version ends up equal to
//! the count of non-fact events applied, minus one.

use std::collections::HashMap;

use log::trace;
use serde_json::Value;

use crate::agg::{Aggregate, AggregateState};
use crate::error::{Error, InvariantViolation};
use crate::evt::Event;
use crate::handle::Handle;
use crate::upcast::{SchemaRegistry, SchemaRegistryBuilder};

//------------ HandlerMap ----------------------------------------------------

/// The mutation handler for one event family.
pub type ApplyFn<S> =
    Box<dyn Fn(&mut S, <S as AggregateState>::Event) + Send + Sync>;

/// Per-aggregate-type dispatch table from event family to mutation
/// handler. Built once at registration time; immutable afterwards.
pub struct HandlerMap<S: AggregateState> {
    handlers: HashMap<&'static str, ApplyFn<S>>,
}

impl<S: AggregateState> HandlerMap<S> {
    fn get(&self, family: &str) -> Result<&ApplyFn<S>, Error> {
        self.handlers.get(family).ok_or_else(|| Error::HandlerMissing {
            family: family.to_string(),
        })
    }
}

//------------ AggregateType -------------------------------------------------

/// Everything registered for one aggregate type: its stream category,
/// its event schema (current constructors plus upcaster chains) and its
/// mutation handlers.
///
/// Obtained only through [`AggregateType::builder`], whose `build` step
/// validates the whole registration eagerly. After a successful build
/// the table is frozen and safe for unsynchronized concurrent reads.
pub struct AggregateType<S: AggregateState> {
    category: &'static str,
    schema: SchemaRegistry<S::Event>,
    handlers: HandlerMap<S>,
}

impl<S: AggregateState> std::fmt::Debug for AggregateType<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateType")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> AggregateType<S> {
    pub fn builder(category: &'static str) -> AggregateTypeBuilder<S> {
        AggregateTypeBuilder {
            category,
            schema: SchemaRegistryBuilder::new(),
            handlers: HashMap::new(),
        }
    }

    /// The stream category, e.g. `"order"`.
    pub fn category(&self) -> &'static str {
        self.category
    }

    pub fn schema(&self) -> &SchemaRegistry<S::Event> {
        &self.schema
    }

    /// Creates a new aggregate instance from its creation event.
    ///
    /// The identity is assigned here; the state is populated purely by
    /// routing the creation event through the live apply path, so it
    /// ends up in `pending_events` for the write path to persist.
    pub fn create(&self, handle: Handle, creation: S::Event) -> Result<Aggregate<S>, Error> {
        let mut agg = Aggregate::reconstitution_shell(handle);
        agg.finish_reconstitution();
        self.apply_live(&mut agg, creation)?;
        Ok(agg)
    }

    /// Applies an event raised live against an aggregate.
    ///
    /// Increments the version before dispatching to the mutation
    /// handler, runs the invariant checks before and after the mutation
    /// (per-field validation is the handler's own business while it
    /// runs), and appends the event to the pending list. A violated
    /// invariant rolls state and version back; the event never reaches
    /// `pending_events`.
    ///
    /// Fact events have no mutation semantics: they go straight to the
    /// pending list without touching version, handlers or invariants.
    pub fn apply_live(&self, agg: &mut Aggregate<S>, event: S::Event) -> Result<(), Error> {
        if agg.is_temporal() {
            return Err(Error::TemporalReadOnly(agg.handle().clone()));
        }
        if event.is_fact() {
            agg.push_pending(event);
            return Ok(());
        }

        let handler = self.handlers.get(event.family())?;
        let checked = !agg.invariant_checks_suppressed();
        let saved_state = agg.state().clone();
        let saved_version = agg.version();

        *agg.version_mut() += 1;
        let outcome = (|| -> Result<(), InvariantViolation> {
            if checked {
                agg.state().check_invariants()?;
            }
            handler(agg.state_mut(), event.clone());
            if checked {
                agg.state().check_invariants()?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                agg.push_pending(event);
                Ok(())
            }
            Err(violation) => {
                agg.restore(saved_state, saved_version);
                Err(Error::Invariant(violation))
            }
        }
    }

    /// Applies an event read back from the log.
    ///
    /// Dispatches to the same mutation handler as the live path, without
    /// invariant checks, and increments the version after the handler
    /// returns. Fact events are skipped entirely.
    pub fn apply_replay(&self, agg: &mut Aggregate<S>, event: S::Event) -> Result<(), Error> {
        if event.is_fact() {
            trace!("skipping fact event '{event}' during replay");
            return Ok(());
        }
        let handler = self.handlers.get(event.family())?;
        handler(agg.state_mut(), event);
        *agg.version_mut() += 1;
        Ok(())
    }
}

//------------ AggregateTypeBuilder ------------------------------------------

/// Registration-time builder for an [`AggregateType`].
///
/// All validation happens in [`build`][Self::build]: the schema graph
/// checks of the upcaster chain builder, plus the requirement that every
/// registered non-fact event family has exactly one mutation handler.
/// Nothing is validated at request time.
pub struct AggregateTypeBuilder<S: AggregateState> {
    category: &'static str,
    schema: SchemaRegistryBuilder<S::Event>,
    handlers: HashMap<&'static str, ApplyFn<S>>,
}

impl<S: AggregateState> AggregateTypeBuilder<S> {
    /// Registers a current-schema event family with its constructor.
    ///
    /// Every family registered this way must also get a
    /// [`handler`][Self::handler]; `build` fails otherwise.
    pub fn event<C>(mut self, family: &'static str, version: u32, construct: C) -> Self
    where
        C: Fn(Value) -> Result<S::Event, serde_json::Error> + Send + Sync + 'static,
    {
        self.schema = self.schema.event(family, version, construct);
        self
    }

    /// Registers the mutation handler for an event family.
    pub fn handler<H>(mut self, family: &'static str, handler: H) -> Self
    where
        H: Fn(&mut S, S::Event) + Send + Sync + 'static,
    {
        self.handlers.insert(family, Box::new(handler));
        self
    }

    /// Registers a fact event family: constructor only, no handler.
    pub fn fact_event<C>(mut self, family: &'static str, version: u32, construct: C) -> Self
    where
        C: Fn(Value) -> Result<S::Event, serde_json::Error> + Send + Sync + 'static,
    {
        self.schema = self.schema.fact_event(family, version, construct);
        self
    }

    /// Registers a schema-migration step for one event family.
    pub fn upcaster<U>(mut self, family: &'static str, from: u32, to: u32, transform: U) -> Self
    where
        U: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.schema = self.schema.upcaster(family, from, to, transform);
        self
    }

    /// Validates the registration and freezes it into an
    /// [`AggregateType`].
    pub fn build(self) -> Result<AggregateType<S>, Error> {
        let schema = self.schema.build()?;

        for family in self.handlers.keys() {
            if !schema.is_registered_event(family) {
                return Err(Error::HandlerUnknownEvent {
                    family: family.to_string(),
                });
            }
        }
        for family in schema.event_families() {
            if !self.handlers.contains_key(family) {
                return Err(Error::HandlerMissing {
                    family: family.to_string(),
                });
            }
        }

        Ok(AggregateType {
            category: self.category,
            schema,
            handlers: HandlerMap {
                handlers: self.handlers,
            },
        })
    }
}
