//! Connection management for a console that serves many kafka clusters through one API.
//!
//! Clusters are configured statically and discovered or updated through a resource watch.
//! The main pieces are:
//!
//! * [`merger::ConfigMerger`], merges configuration, resource status and defaults into the client properties of a cluster.
//! * [`registry::ClusterRegistry`], the concurrently readable map of cluster id to [`context::ConnectionContext`].
//! * [`registry::RegistryOwner`], the single task applying [`resource::ResourceEvent`]s to the registry.
//! * [`resolver::RequestResolver`], hands a request the context of its cluster, building clients with the
//!   caller's credentials when the cluster requires them, see [`credentials`].
//! * [`client::ClientFactory`], the seam to the client library that talks to the brokers.
//!
//! [`services::Services`] wires these together.

// Accidentally printing would break json log output
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod client;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
mod http;
pub mod merger;
mod observability;
pub mod outcome;
pub mod properties;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod runner;
pub mod services;
mod tracing_panic_handler;
