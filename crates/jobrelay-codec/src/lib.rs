//! The value codec (C1). `serialize` walks an argument/result graph and
//! applies type-driven rewrites: byte arrays and numeric arrays above
//! [`BLOB_THRESHOLD_BYTES`] are shipped to the blob store and replaced by a
//! typed reference; `File` values are always normalised to blob-store URIs;
//! scalars and strings pass through untouched. `deserialize` reverses every
//! rewrite. The composition `serialize ∘ deserialize` is the identity on
//! already-canonicalised graphs — see [`canonicalize`].

use anyhow::{anyhow, Context as _, Result};
use jobrelay_base::value::{File, FileRef, NumArray, NumDtype, Value};
use jobrelay_blobstore::BlobStore;
use serde_json::json;

/// Bytes/numeric-array payloads at or under this size are left inline in the
/// plain-data form instead of being shipped to the blob store.
pub const BLOB_THRESHOLD_BYTES: usize = 4096;

/// Serialises a [`Value`] graph to plain JSON data, rewriting large blobs
/// and file references through `blobs` (C1).
pub fn serialize(value: &Value, blobs: &dyn BlobStore) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::Bytes(b) => {
            if b.len() > BLOB_THRESHOLD_BYTES {
                let uri = blobs
                    .put(b)
                    .context("blob store unavailable while serialising bytes")?;
                json!({"t": "bytes_blob", "uri": uri, "len": b.len()})
            } else {
                json!({"t": "bytes_inline", "data": b})
            }
        }
        Value::NumArray(arr) => {
            if arr.byte_len() > BLOB_THRESHOLD_BYTES {
                let uri = blobs
                    .put(&arr.data)
                    .context("blob store unavailable while serialising array")?;
                json!({
                    "t": "numarray_blob",
                    "uri": uri,
                    "dtype": dtype_str(arr.dtype),
                    "shape": arr.shape,
                })
            } else {
                json!({
                    "t": "numarray_inline",
                    "dtype": dtype_str(arr.dtype),
                    "shape": arr.shape,
                    "data": arr.data,
                })
            }
        }
        Value::File(file) => {
            let (uri, content_hash) = match &file.reference {
                FileRef::Blob { uri, content_hash } => (uri.clone(), content_hash.clone()),
                FileRef::Local { path } => {
                    let bytes = std::fs::read(path)
                        .with_context(|| format!("reading local file {path}"))?;
                    let hash = sha256_hex(&bytes);
                    let uri = blobs
                        .put(&bytes)
                        .context("blob store unavailable while serialising file")?;
                    (uri, Some(hash))
                }
            };
            json!({"t": "file", "uri": uri, "content_hash": content_hash})
        }
        Value::JobRef(id) => json!({"t": "job_ref", "id": id.to_string()}),
        Value::Seq(items) => {
            let out: Result<Vec<_>> = items.iter().map(|v| serialize(v, blobs)).collect();
            serde_json::Value::Array(out?)
        }
        Value::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), serialize(v, blobs)?);
            }
            serde_json::Value::Object(out)
        }
    })
}

/// Reverses [`serialize`], fetching blob-backed payloads back from `blobs`.
pub fn deserialize(plain: &serde_json::Value, blobs: &dyn BlobStore) -> Result<Value> {
    Ok(match plain {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().ok_or_else(|| anyhow!("invalid number"))?)
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let out: Result<Vec<_>> = items.iter().map(|v| deserialize(v, blobs)).collect();
            Value::Seq(out?)
        }
        serde_json::Value::Object(map) => {
            let tag = map.get("t").and_then(|v| v.as_str());
            match tag {
                Some("bytes_inline") => {
                    let data = map
                        .get("data")
                        .ok_or_else(|| anyhow!("missing data"))?
                        .as_array()
                        .ok_or_else(|| anyhow!("bytes_inline.data must be an array"))?
                        .iter()
                        .map(|v| v.as_u64().map(|n| n as u8).ok_or_else(|| anyhow!("bad byte")))
                        .collect::<Result<Vec<u8>>>()?;
                    Value::Bytes(data)
                }
                Some("bytes_blob") => {
                    let uri = map
                        .get("uri")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("missing uri"))?;
                    let data = blobs.get(uri).context("blob store unavailable while fetching bytes")?;
                    Value::Bytes(data)
                }
                Some("numarray_inline") => {
                    let dtype = parse_dtype(map.get("dtype"))?;
                    let shape = parse_shape(map.get("shape"))?;
                    let data = map
                        .get("data")
                        .ok_or_else(|| anyhow!("missing data"))?
                        .as_array()
                        .ok_or_else(|| anyhow!("numarray_inline.data must be an array"))?
                        .iter()
                        .map(|v| v.as_u64().map(|n| n as u8).ok_or_else(|| anyhow!("bad byte")))
                        .collect::<Result<Vec<u8>>>()?;
                    Value::NumArray(NumArray { dtype, shape, data })
                }
                Some("numarray_blob") => {
                    let dtype = parse_dtype(map.get("dtype"))?;
                    let shape = parse_shape(map.get("shape"))?;
                    let uri = map
                        .get("uri")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("missing uri"))?;
                    let data = blobs.get(uri).context("blob store unavailable while fetching array")?;
                    Value::NumArray(NumArray { dtype, shape, data })
                }
                Some("file") => {
                    let uri = map
                        .get("uri")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("missing uri"))?
                        .to_string();
                    let content_hash = map
                        .get("content_hash")
                        .and_then(|v| v.as_str())
                        .map(ToOwned::to_owned);
                    Value::File(File::blob(uri, content_hash))
                }
                Some("job_ref") => {
                    let id = map
                        .get("id")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("missing id"))?
                        .parse()
                        .context("parsing job id")?;
                    Value::JobRef(id)
                }
                Some(other) => return Err(anyhow!("unknown plain-data tag {other:?}")),
                None => {
                    let mut out = std::collections::BTreeMap::new();
                    for (k, v) in map {
                        out.insert(k.clone(), deserialize(v, blobs)?);
                    }
                    Value::Map(out)
                }
            }
        }
    })
}

/// `canonicalize(v) = deserialize(serialize(v))`: resolves every `File` and
/// large array/bytes payload into its stable, blob-backed form. A job's
/// result is stored in this canonical form, which is why the testable
/// property "for every FINISHED job J, deserialize(serialize(J.result))
/// equals J.result" holds — the canonical form is a fixed point.
pub fn canonicalize(value: &Value, blobs: &dyn BlobStore) -> Result<Value> {
    deserialize(&serialize(value, blobs)?, blobs)
}

/// Resolves every [`File`] in the graph to local bytes on disk, used by
/// `execute_locally` (C3) unless the function opted out via
/// `no_resolve_input_files`.
pub fn resolve_files(value: &Value, blobs: &dyn BlobStore, dest_dir: &std::path::Path) -> Result<Value> {
    Ok(match value {
        Value::File(file) => {
            let path = match &file.reference {
                FileRef::Local { path } => std::path::PathBuf::from(path),
                FileRef::Blob { uri, .. } => {
                    let bytes = blobs.get(uri).context("blob store unavailable while resolving file")?;
                    let name = uri.trim_start_matches(jobrelay_blobstore::URI_SCHEME);
                    let path = dest_dir.join(name);
                    std::fs::write(&path, &bytes)?;
                    path
                }
            };
            Value::File(File::local(path.to_string_lossy().into_owned()))
        }
        Value::Seq(items) => Value::Seq(
            items
                .iter()
                .map(|v| resolve_files(v, blobs, dest_dir))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => {
            let mut out = std::collections::BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_files(v, blobs, dest_dir)?);
            }
            Value::Map(out)
        }
        other => other.clone(),
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn dtype_str(dtype: NumDtype) -> &'static str {
    match dtype {
        NumDtype::I64 => "i64",
        NumDtype::F64 => "f64",
    }
}

fn parse_dtype(v: Option<&serde_json::Value>) -> Result<NumDtype> {
    match v.and_then(|v| v.as_str()) {
        Some("i64") => Ok(NumDtype::I64),
        Some("f64") => Ok(NumDtype::F64),
        other => Err(anyhow!("unknown dtype {other:?}")),
    }
}

fn parse_shape(v: Option<&serde_json::Value>) -> Result<Vec<usize>> {
    v.and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("missing shape"))?
        .iter()
        .map(|v| v.as_u64().map(|n| n as usize).ok_or_else(|| anyhow!("bad shape entry")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_blobstore::FsBlobStore;
    use std::collections::BTreeMap;

    fn store() -> FsBlobStore {
        FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        let blobs = store();
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(2.5),
            Value::Str("hi".into()),
        ] {
            let plain = serialize(&v, &blobs).unwrap();
            assert_eq!(deserialize(&plain, &blobs).unwrap(), v);
        }
    }

    #[test]
    fn small_bytes_stay_inline_and_round_trip() {
        let blobs = store();
        let v = Value::Bytes(vec![1, 2, 3]);
        let plain = serialize(&v, &blobs).unwrap();
        assert_eq!(plain["t"], "bytes_inline");
        assert_eq!(deserialize(&plain, &blobs).unwrap(), v);
    }

    #[test]
    fn large_bytes_go_through_blob_store_and_round_trip() {
        let blobs = store();
        let big = vec![7u8; BLOB_THRESHOLD_BYTES + 1];
        let v = Value::Bytes(big.clone());
        let plain = serialize(&v, &blobs).unwrap();
        assert_eq!(plain["t"], "bytes_blob");
        assert_eq!(deserialize(&plain, &blobs).unwrap(), Value::Bytes(big));
    }

    #[test]
    fn empty_bytes_collide_with_nothing_and_still_round_trip() {
        let blobs = store();
        let v = Value::Bytes(vec![]);
        let plain = serialize(&v, &blobs).unwrap();
        assert_eq!(deserialize(&plain, &blobs).unwrap(), v);
    }

    #[test]
    fn mixed_graph_is_idempotent_after_canonicalisation() {
        let blobs = store();
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert(
            "b".to_string(),
            Value::Seq(vec![Value::Str("x".into()), Value::Bytes(vec![9u8; 9000])]),
        );
        let v = Value::Map(map);

        let canonical = canonicalize(&v, &blobs).unwrap();
        let again = canonicalize(&canonical, &blobs).unwrap();
        assert_eq!(canonical, again);
    }

    #[test]
    fn file_is_normalised_to_a_blob_uri() {
        let blobs = store();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"contents").unwrap();
        let v = Value::File(File::local(tmp.path().to_string_lossy().into_owned()));
        let canonical = canonicalize(&v, &blobs).unwrap();
        match canonical {
            Value::File(f) => assert!(f.is_resolved()),
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[test]
    fn empty_argument_graph_round_trips() {
        let blobs = store();
        let v = Value::empty_map();
        let plain = serialize(&v, &blobs).unwrap();
        assert_eq!(deserialize(&plain, &blobs).unwrap(), v);
    }
}
