//! Strongly-typed warehouse identifiers.

use crate::newtype_string::define_identifier;

define_identifier! {
    /// Name of a warehouse table (staging, dimension, or fact).
    pub struct TableName;
}

define_identifier! {
    /// Name of a column within a table.
    pub struct ColumnName;
}
