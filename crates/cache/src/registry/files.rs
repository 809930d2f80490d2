//! Blob-backed encoders for files and arrays
//!
//! Both store their content in the blob store and record a reconstruction
//! call whose first argument is the [`FileAsset`]:
//!
//! ```json
//! {
//!   "type": "python_call",
//!   "callable": "callcache::files:open_file",
//!   "args": [{"type": "text/plain", "href": "...", "file:checksum": "...",
//!             "file:size": 11, "file:local_path": "..."}],
//!   "kwargs": {"storage_options": {}, "mode": "rb"}
//! }
//! ```
//!
//! Decoding verifies the blob checksum before handing the path out.

use super::{Context, Registry, TypeKey};
use crate::value::{Args, CachedFile, NdArray, Value};
use crate::{Error, Result};
use callcache_cas::{DIRECTORY_STORE_KIND, FileAsset, extension_for, token};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Rebuilds [`Value::File`] from a verified asset
pub const OPEN_FILE: &str = "callcache::files:open_file";
/// Rebuilds [`Value::Array`] from a verified asset
pub const OPEN_ARRAY: &str = "callcache::files:open_array";

/// Single-file array layout: a JSON header line followed by little-endian `f64`s
pub const ARRAY_FILE_KIND: &str = "application/x-ndarray";

/// Content kinds array results can be stored as
pub const SUPPORTED_ARRAY_KINDS: [&str; 2] = [ARRAY_FILE_KIND, DIRECTORY_STORE_KIND];

const STORAGE_OPTIONS_KEY: &str = "storage_options";
const DIRECTORY_METADATA: &str = ".zarray";
const DTYPE: &str = "<f8";

pub(super) fn register(registry: &Registry) {
    registry.register_encoder(TypeKey::File, encode_file);
    registry.register_encoder(TypeKey::Array, encode_array);

    let symbols: [(&str, fn(&Context<'_>, &Args) -> Result<Value>); 2] =
        [(OPEN_FILE, open_file), (OPEN_ARRAY, open_array)];
    for (reference, func) in symbols {
        if let Err(e) = registry.register_function(reference, func) {
            tracing::error!(reference, "Built-in symbol rejected: {e}");
        }
    }
}

fn reconstruction_args(asset: &FileAsset, ctx: &Context<'_>) -> Result<Args> {
    let asset = serde_json::to_value(asset)?;
    let storage_options = serde_json::Value::Object(ctx.settings.storage_options.clone());
    Ok(Args::new()
        .arg(Value::from_json(&asset))
        .kwarg(STORAGE_OPTIONS_KEY, Value::from_json(&storage_options)))
}

fn asset_arg(args: &Args) -> Result<FileAsset> {
    args.get(0)
        .and_then(Value::to_json)
        .as_ref()
        .and_then(FileAsset::from_json)
        .ok_or_else(|| Error::decode("first argument is not a file asset"))
}

fn encode_file(registry: &Registry, value: &Value, ctx: &Context<'_>) -> Result<serde_json::Value> {
    let Value::File(file) = value else {
        return Err(Error::encode(value.type_name(), "not a file"));
    };
    let asset = ctx
        .blobs
        .put_file(&file.path, ctx.settings.io_delete_original)?;
    let mut args = reconstruction_args(&asset, ctx)?;
    for (name, option) in &file.open_options {
        args.keyword
            .entry(name.clone())
            .or_insert_with(|| option.clone());
    }
    registry.call_tree(OPEN_FILE, &args, ctx)
}

fn open_file(ctx: &Context<'_>, args: &Args) -> Result<Value> {
    let asset = asset_arg(args)?;
    let path = ctx.blobs.verify(&asset)?;
    let open_options = args
        .keyword
        .iter()
        .filter(|(name, _)| name.as_str() != STORAGE_OPTIONS_KEY)
        .map(|(name, option)| (name.clone(), option.clone()))
        .collect();
    Ok(Value::File(CachedFile { path, open_options }))
}

#[derive(Debug, Serialize, Deserialize)]
struct ArrayHeader {
    shape: Vec<usize>,
    dtype: String,
}

/// Metadata document of a directory-store array (zarr v2 layout, one chunk)
#[derive(Debug, Serialize, Deserialize)]
struct DirectoryArrayMetadata {
    zarr_format: u8,
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: String,
    order: String,
    compressor: Option<serde_json::Value>,
    fill_value: Option<f64>,
    filters: Option<serde_json::Value>,
}

fn chunk_name(shape: &[usize]) -> String {
    if shape.is_empty() {
        "0".to_string()
    } else {
        vec!["0"; shape.len()].join(".")
    }
}

fn array_bytes(array: &NdArray) -> Vec<u8> {
    array.data().iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn array_from_bytes(shape: Vec<usize>, bytes: &[u8]) -> Result<NdArray> {
    if bytes.len() % 8 != 0 {
        return Err(Error::decode(format!(
            "array payload of {} bytes is not a whole number of f64",
            bytes.len()
        )));
    }
    let data = bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect();
    NdArray::new(shape, data).map_err(|e| Error::decode(e.to_string()))
}

fn write_array(path: &Path, kind: &str, array: &NdArray) -> callcache_cas::Result<()> {
    let invalid = |e: serde_json::Error| callcache_cas::Error::validation(e.to_string());
    if kind == DIRECTORY_STORE_KIND {
        fs::create_dir_all(path)
            .map_err(|e| callcache_cas::Error::io(e, path, "create_dir_all"))?;
        let metadata = DirectoryArrayMetadata {
            zarr_format: 2,
            shape: array.shape().to_vec(),
            chunks: array.shape().to_vec(),
            dtype: DTYPE.to_string(),
            order: "C".to_string(),
            compressor: None,
            fill_value: None,
            filters: None,
        };
        let meta_path = path.join(DIRECTORY_METADATA);
        fs::write(&meta_path, serde_json::to_vec(&metadata).map_err(invalid)?)
            .map_err(|e| callcache_cas::Error::io(e, &meta_path, "write"))?;
        let chunk_path = path.join(chunk_name(array.shape()));
        fs::write(&chunk_path, array_bytes(array))
            .map_err(|e| callcache_cas::Error::io(e, &chunk_path, "write"))
    } else {
        let header = ArrayHeader {
            shape: array.shape().to_vec(),
            dtype: DTYPE.to_string(),
        };
        let mut content = serde_json::to_vec(&header).map_err(invalid)?;
        content.push(b'\n');
        content.extend(array_bytes(array));
        fs::write(path, content).map_err(|e| callcache_cas::Error::io(e, path, "write"))
    }
}

fn read_array(path: &Path) -> Result<NdArray> {
    if path.is_dir() {
        let meta_path = path.join(DIRECTORY_METADATA);
        let raw = fs::read(&meta_path).map_err(|e| Error::io(e, &meta_path, "read"))?;
        let metadata: DirectoryArrayMetadata = serde_json::from_slice(&raw)?;
        if metadata.dtype != DTYPE {
            return Err(Error::decode(format!("unsupported dtype {}", metadata.dtype)));
        }
        let chunk_path = path.join(chunk_name(&metadata.shape));
        let bytes = fs::read(&chunk_path).map_err(|e| Error::io(e, &chunk_path, "read"))?;
        return array_from_bytes(metadata.shape, &bytes);
    }
    let raw = fs::read(path).map_err(|e| Error::io(e, path, "read"))?;
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::decode("array file has no header line"))?;
    let header: ArrayHeader = serde_json::from_slice(&raw[..split])?;
    if header.dtype != DTYPE {
        return Err(Error::decode(format!("unsupported dtype {}", header.dtype)));
    }
    array_from_bytes(header.shape, &raw[split + 1..])
}

fn encode_array(registry: &Registry, value: &Value, ctx: &Context<'_>) -> Result<serde_json::Value> {
    let Value::Array(array) = value else {
        return Err(Error::encode(value.type_name(), "not an array"));
    };
    let kind = ctx.settings.array_content_kind.as_str();
    let ext = extension_for(kind)
        .filter(|_| SUPPORTED_ARRAY_KINDS.contains(&kind))
        .ok_or_else(|| Error::encode("array", format!("unsupported array content kind {kind:?}")))?;

    // Structural token: no need to materialize before naming the blob
    let shape: Vec<u8> = array
        .shape()
        .iter()
        .flat_map(|d| (*d as u64).to_le_bytes())
        .collect();
    let data = array_bytes(array);
    let key = token([kind.as_bytes(), shape.as_slice(), data.as_slice()]);

    let asset = ctx
        .blobs
        .put_with(&key, ext, |staged| write_array(staged, kind, array))?;
    let args = reconstruction_args(&asset, ctx)?;
    registry.call_tree(OPEN_ARRAY, &args, ctx)
}

fn open_array(ctx: &Context<'_>, args: &Args) -> Result<Value> {
    let asset = asset_arg(args)?;
    let path = ctx.blobs.verify(&asset)?;
    read_array(&path).map(Value::Array)
}
