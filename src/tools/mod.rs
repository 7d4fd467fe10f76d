//! Tool argument types, one module per tool family.

pub mod database;
pub mod graph;
