//! Purpose: Query text helpers shared by the executor and its callers.
//! Exports: `prepare` (templating) and `statement` (leading-keyword classification).

pub mod prepare;
pub mod statement;
