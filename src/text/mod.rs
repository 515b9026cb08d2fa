//! Purpose: Charset-aware text handling for values written through the executor.
//! Exports: `charset` (schema charset resolution) and `sanitize` (byte-level repair).

pub mod charset;
pub mod sanitize;
