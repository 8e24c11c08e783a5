//! Shared data model for the panoptes telemetry pipeline.
//!
//! Every protocol driver normalises provider frames into a [`DataStore`];
//! the supervisor forwards them as [`ExtDataStore`] over a bounded channel
//! to the demultiplexer, which fans out to producer and database sinks.
//! The [`Registrar`] is the name-to-factory table shared by the producer,
//! database, and telemetry-driver registries.

pub mod datastore;
pub mod registrar;
pub mod value;

pub use datastore::{DataStore, ExtDataStore, ExtDsReceiver, ExtDsSender};
pub use registrar::Registrar;
pub use value::Value;
