//! Small shared utilities.

pub mod id_generator;
pub mod testing;
