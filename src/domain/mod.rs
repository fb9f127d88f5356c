// Core trading entities and their invariants
pub mod entities;

// Domain-specific error types and denial codes
pub mod errors;

// Wire payloads of broadcast events
pub mod events;

// Signal fingerprints (intent identity)
pub mod fingerprint;

// Port interfaces: Strategy and ExchangeAdapter
pub mod ports;

// Repository traits
pub mod repositories;

// Wire-level and in-process value types
pub mod types;
