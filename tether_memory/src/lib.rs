#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the broker and its controls.
mod broker;
pub use self::broker::MemoryBroker;

/// Implements the engine contract on top of the broker state.
mod engine;

/// Implements the routing rules of the exchange kinds.
mod routing;

/// Holds the broker entities and the rules that govern them.
mod state;
