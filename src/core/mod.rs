// Core modules: errors, configuration, time, keys, and the cached result snapshot.
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod snapshot;
