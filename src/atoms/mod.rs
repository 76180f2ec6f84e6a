// ── Gisma Atoms Layer ──────────────────────────────────────────────────────
// Pure constants, wire types and error types. No side effects, no I/O.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/ or config.rs.

pub mod constants;
pub mod error;
pub mod types;
