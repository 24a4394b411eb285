//! Document data model.
//!
//! A [`Document`] is an immutable, insertion-ordered collection of uniquely
//! keyed fields, identified by a 128-bit [`DocumentId`]. Field values form a
//! closed set of tagged variants ([`FieldValue`]); serialization and scoring
//! dispatch on the tag.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VulcanoError};

/// Namespace for content-derived document ids.
const CONTENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5675_6c63_616e_6f44_6200_0000_0000_0001);

/// 128-bit document identifier.
///
/// Either random (v4) or derived from content bytes (v5), so that the same
/// content always maps to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Generate a random document id.
    pub fn random() -> Self {
        DocumentId(Uuid::new_v4())
    }

    /// Derive a document id from content bytes.
    pub fn from_content(content: &[u8]) -> Self {
        DocumentId(Uuid::new_v5(&CONTENT_ID_NAMESPACE, content))
    }

    /// Parse a document id from its canonical string form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(DocumentId)
            .map_err(|e| VulcanoError::validation(format!("invalid document id '{s}': {e}")))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Row-major float matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Create a matrix from row-major data. Fails when `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(VulcanoError::validation("matrix dimensions must be >= 1"));
        }
        if data.len() != rows * cols {
            return Err(VulcanoError::validation(format!(
                "matrix data length {} does not match {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Borrow row `r` as a slice.
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }
}

/// The closed set of field value types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// UTF-8 string, unbounded except by segment size.
    String(String),
    /// Signed 32-bit integer.
    Integer(i32),
    /// Dense float32 vector.
    Vector(Vec<f32>),
    /// Row-major float32 matrix.
    Matrix(Matrix),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            FieldValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&Matrix> {
        match self {
            FieldValue::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<Vec<f32>> for FieldValue {
    fn from(v: Vec<f32>) -> Self {
        FieldValue::Vector(v)
    }
}

impl From<Matrix> for FieldValue {
    fn from(m: Matrix) -> Self {
        FieldValue::Matrix(m)
    }
}

/// A named field inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    key: String,
    value: FieldValue,
}

impl Field {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }
}

/// An immutable document: an id plus insertion-ordered, uniquely keyed fields.
///
/// Re-adding a document with the same id overwrites the previous version
/// (last-writer-wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    fields: Vec<Field>,
}

impl Document {
    /// Start building a document with a random id.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder {
            id: DocumentId::random(),
            fields: Vec::new(),
        }
    }

    /// Start building a document with a specific id.
    pub fn builder_with_id(id: DocumentId) -> DocumentBuilder {
        DocumentBuilder {
            id,
            fields: Vec::new(),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look up a field value by key.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.fields.iter().any(|f| f.key == key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fluent builder for [`Document`].
#[derive(Debug)]
pub struct DocumentBuilder {
    id: DocumentId,
    fields: Vec<Field>,
}

impl DocumentBuilder {
    /// Add a field. Replaces any existing field with the same key so that
    /// keys stay unique within the document.
    pub fn add_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.fields.iter_mut().find(|f| f.key == key) {
            existing.value = value;
        } else {
            self.fields.push(Field { key, value });
        }
        self
    }

    /// Add a string field.
    pub fn add_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_field(key, FieldValue::String(value.into()))
    }

    /// Add an integer field.
    pub fn add_integer(self, key: impl Into<String>, value: i32) -> Self {
        self.add_field(key, FieldValue::Integer(value))
    }

    /// Add a vector field.
    pub fn add_vector(self, key: impl Into<String>, value: Vec<f32>) -> Self {
        self.add_field(key, FieldValue::Vector(value))
    }

    /// Add a matrix field.
    pub fn add_matrix(self, key: impl Into<String>, value: Matrix) -> Self {
        self.add_field(key, FieldValue::Matrix(value))
    }

    /// Add a bytes field.
    pub fn add_bytes(self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.add_field(key, FieldValue::Bytes(value))
    }

    pub fn build(self) -> Document {
        Document {
            id: self.id,
            fields: self.fields,
        }
    }
}
