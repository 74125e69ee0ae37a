//! Domain Layer - Core streaming types and subscription bookkeeping.
//!
//! This layer contains the market data records, the typed observer
//! interface, and the reference-counted subscription registry. Nothing
//! here performs I/O.

/// Market data records, channels, symbols and observers.
pub mod streaming;

/// Reference-counted subscription registry.
pub mod subscription;
