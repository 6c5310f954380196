//! Ordered table of named field variables.
//!
//! The table fixes the index → name mapping used by
//! [`TimeStepWriter::write_data`](crate::writer::TimeStepWriter::write_data)
//! and the order of field entries in the metadata document. All ranks must
//! construct identical tables.

use crate::writer_error::{Result, WriterError};
use serde::{Deserialize, Serialize};

/// Mesh entity a field is sampled on.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum FieldCenter {
    /// One value per cell.
    #[default]
    Cell,
    /// One value per vertex.
    Node,
}

impl FieldCenter {
    /// XDMF `Center` attribute value.
    pub fn xdmf_name(self) -> &'static str {
        match self {
            FieldCenter::Cell => "Cell",
            FieldCenter::Node => "Node",
        }
    }

    /// Parse an XDMF `Center` attribute value.
    pub fn from_xdmf_name(name: &str) -> Option<Self> {
        match name {
            "Cell" => Some(FieldCenter::Cell),
            "Node" => Some(FieldCenter::Node),
            _ => None,
        }
    }
}

/// A named scalar field.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Name used in file names and the metadata document.
    pub name: String,
    /// Entity the field lives on.
    pub center: FieldCenter,
}

impl Variable {
    /// Cell-centered variable.
    pub fn cell(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            center: FieldCenter::Cell,
        }
    }

    /// Vertex-centered variable.
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            center: FieldCenter::Node,
        }
    }
}

/// Names reserved by the metadata document and the raw file layout.
const RESERVED: [&str; 4] = ["partition", "geometry", "connect", "layout"];

/// Non-empty, duplicate-free, ordered set of variables.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VariableTable {
    variables: Vec<Variable>,
}

impl VariableTable {
    /// Validate and build a table.
    pub fn new(variables: Vec<Variable>) -> Result<Self> {
        if variables.is_empty() {
            return Err(WriterError::InvalidVariables(
                "at least one variable is required".into(),
            ));
        }
        for (idx, var) in variables.iter().enumerate() {
            if var.name.is_empty() {
                return Err(WriterError::InvalidVariables(format!(
                    "variable {idx} has an empty name"
                )));
            }
            if !var
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            {
                return Err(WriterError::InvalidVariables(format!(
                    "variable name `{}` may only contain ASCII letters, digits, `_`, `-` and `.`",
                    var.name
                )));
            }
            if RESERVED.contains(&var.name.as_str()) {
                return Err(WriterError::InvalidVariables(format!(
                    "variable name `{}` is reserved",
                    var.name
                )));
            }
            if variables[..idx].iter().any(|v| v.name == var.name) {
                return Err(WriterError::InvalidVariables(format!(
                    "duplicate variable name `{}`",
                    var.name
                )));
            }
        }
        Ok(Self { variables })
    }

    /// Cell-centered table from plain names.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(Variable::cell).collect())
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Always false for a validated table.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Variable at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&Variable> {
        self.variables.get(index)
    }

    /// Index of the variable called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    /// Iterate in table order.
    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.variables.iter()
    }
}

impl<'a> IntoIterator for &'a VariableTable {
    type Item = &'a Variable;
    type IntoIter = std::slice::Iter<'a, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
