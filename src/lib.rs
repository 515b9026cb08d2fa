//! Purpose: Query-result cache with pluggable storage backends and charset-safe writes.
//! Exports: `api` (stable facade), plus `core`, `store`, `query`, `text`, `driver`, `executor`.
//! Role: Library backing the `querycache` CLI and any data-access layer built on a `Driver`.
//! Invariants: Cache failures never abort a query; sanitize and driver failures always surface.
//! Invariants: Modules prefer explicit inputs/outputs over hidden process-wide state.
pub mod api;
pub mod core;
pub mod driver;
pub mod executor;
pub mod query;
pub mod store;
pub mod text;
