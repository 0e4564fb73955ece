//! Component/attribute model for laboratory instrument control.
//!
//! Hardware is modelled as [`Component`]s exposing named, typed, observable
//! [`Attribute`]s and asynchronous [`Action`]s. Actions that touch the same physical
//! resource run one at a time on a [`ResourceWorker`]; [`CompositeComponent`]s wrap
//! several components behind one interface; a [`MetadataPropagator`] keeps dependent
//! components' metadata in step with the attributes that influence them; and the
//! [`remote`] layer serves components over TCP so that proxies in another process
//! behave exactly like local components.
//!
//! The `daq-modeld` binary hosts the simulated drivers of [`sim`] from a TOML
//! configuration (see [`config`]).

pub mod action;
pub mod attribute;
pub mod component;
pub mod composite;
pub mod config;
pub mod error;
pub mod executor;
pub mod limits;
pub mod logging;
pub mod metadata;
pub mod propagator;
pub mod registry;
pub mod remote;
pub mod sim;

pub use action::{Action, ActionContext, ActionFuture, ActionState, ActionUpdate, Progress};
pub use attribute::{Attribute, AttributeEvent, AttributeHandle, Constraint, Subscription};
pub use component::{Component, ComponentDescriptor, ComponentState, LocalComponent};
pub use composite::CompositeComponent;
pub use error::{DaqError, DaqResult};
pub use executor::{ExecutorPool, ResourceWorker};
pub use metadata::{Metadata, MetadataKey, VOCABULARY_VERSION};
pub use propagator::{MetadataPropagator, MetadataRule, RuleSet};
pub use registry::ComponentRegistry;
