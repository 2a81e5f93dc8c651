//! The tagged-variant value type that argument graphs, result graphs, and
//! the codec all operate over (see Design Note "Dynamic argument graphs").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// An n-dimensional numeric array, carried as row-major bytes plus the shape
/// and element type needed to interpret them. Large arrays are the ones the
/// codec rewrites through the blob store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumArray {
    pub dtype: NumDtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl NumArray {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumDtype {
    I64,
    F64,
}

/// Where a [`File`]'s bytes currently live. Serialisation always flows
/// through the blob store, so a `Local` file becomes a `Blob` reference
/// before it leaves the host (see C1).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileRef {
    Local { path: String },
    Blob { uri: String, content_hash: Option<String> },
}

/// A value type carrying a handle to file content. Ownership is always by
/// value; a `File` never refers back to another job's filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub reference: FileRef,
}

impl File {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            reference: FileRef::Local { path: path.into() },
        }
    }

    pub fn blob(uri: impl Into<String>, content_hash: Option<String>) -> Self {
        Self {
            reference: FileRef::Blob {
                uri: uri.into(),
                content_hash,
            },
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.reference, FileRef::Blob { .. })
    }
}

/// The tagged-variant value type that flows through argument graphs, result
/// graphs, and the codec. `Map` uses a `BTreeMap` so fingerprint
/// serialisation is deterministic without a separate key-sorting pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    NumArray(NumArray),
    File(File),
    JobRef(JobId),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Walks the graph, replacing every [`JobRef`](Value::JobRef) using
    /// `resolve`. Used by `resolve_inputs` (C3) and by fingerprint
    /// computation, which replaces each reference with the upstream job's
    /// fingerprint instead of its result.
    pub fn map_job_refs<E>(
        &self,
        resolve: &mut impl FnMut(JobId) -> Result<Value, E>,
    ) -> Result<Value, E> {
        Ok(match self {
            Value::JobRef(id) => resolve(*id)?,
            Value::Seq(items) => Value::Seq(
                items
                    .iter()
                    .map(|v| v.map_job_refs(resolve))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Map(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| Ok((k.clone(), v.map_job_refs(resolve)?)))
                    .collect::<Result<_, E>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Collects every distinct upstream job referenced anywhere in the
    /// graph, in first-encountered order.
    pub fn job_refs(&self) -> Vec<JobId> {
        let mut out = Vec::new();
        self.collect_job_refs(&mut out);
        out
    }

    fn collect_job_refs(&self, out: &mut Vec<JobId>) {
        match self {
            Value::JobRef(id) => {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
            Value::Seq(items) => items.iter().for_each(|v| v.collect_job_refs(out)),
            Value::Map(m) => m.values().for_each(|v| v.collect_job_refs(out)),
            _ => {}
        }
    }

    /// True if the graph contains no [`File`] or [`JobRef`] — the "empty
    /// argument graph" boundary case is just `Value::empty_map()`, but this
    /// helper is used to decide whether resolution work is needed at all.
    pub fn is_fully_scalar(&self) -> bool {
        match self {
            Value::File(_) | Value::JobRef(_) => false,
            Value::Seq(items) => items.iter().all(Value::is_fully_scalar),
            Value::Map(m) => m.values().all(Value::is_fully_scalar),
            _ => true,
        }
    }
}
