//! Per-role job handlers.

pub(crate) mod intermediate;
pub(crate) mod leaf;
pub(crate) mod root;
