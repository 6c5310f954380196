//! Data module: the field variables a writer records each step.
#![warn(missing_docs)]

pub mod variables;

pub use variables::{FieldCenter, Variable, VariableTable};
