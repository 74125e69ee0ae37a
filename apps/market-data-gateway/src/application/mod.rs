//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for the upstream provider (streaming transport, REST).
pub mod ports;

/// Application services for streaming consumers and reference data.
pub mod services;
