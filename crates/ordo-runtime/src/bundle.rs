//! Execution bundle assembly.
//!
//! An execution bundle is a gzipped tar archive holding the order's code
//! tree plus the files the worker contract expects:
//! - `secrets.env.age` — the encrypted env map (standard orders)
//! - `env_keys.env` — sorted plaintext env var names, no values
//! - `secrets.src` — sorted credential source names that were fetched
//! - `cmds.json` / `env_vars.json` — command list and plaintext env map
//!   (remote-agent orders, which skip envelope encryption)

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use ordo_kernel::KernelError;

use crate::source::{CodeFile, CodeTree};

/// Env var carrying the presigned callback URL into the worker.
pub const ENV_CALLBACK_URL: &str = "CALLBACK_URL";
/// Env var carrying the order timeout into the worker.
pub const ENV_TIMEOUT: &str = "TIMEOUT";

/// Assembles the full env map for one order.
///
/// Merge order: user env vars -> config values -> secret values -> callback
/// and timeout -> engine introspection fields. Later sources win on key
/// collision.
#[derive(Clone, Debug, Default)]
pub struct EnvBundle {
    pub run_id: String,
    pub order_id: String,
    pub order_num: String,
    pub trace_id: String,
    pub flow_id: String,
    pub env_vars: BTreeMap<String, String>,
    pub config_values: BTreeMap<String, String>,
    pub secret_values: BTreeMap<String, String>,
    pub callback_url: String,
    pub timeout_s: u64,
}

impl EnvBundle {
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        merged.extend(self.env_vars.clone());
        merged.extend(self.config_values.clone());
        merged.extend(self.secret_values.clone());
        if !self.callback_url.is_empty() {
            merged.insert(ENV_CALLBACK_URL.to_string(), self.callback_url.clone());
        }
        merged.insert(ENV_TIMEOUT.to_string(), self.timeout_s.to_string());
        merged.insert("TRACE_ID".to_string(), self.trace_id.clone());
        merged.insert("RUN_ID".to_string(), self.run_id.clone());
        merged.insert("ORDER_ID".to_string(), self.order_id.clone());
        merged.insert("ORDER_NUM".to_string(), self.order_num.clone());
        merged.insert("FLOW_ID".to_string(), self.flow_id.clone());
        merged
    }

    /// Sorted credential source names that were fetched, for the audit
    /// manifest.
    pub fn secret_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .config_values
            .keys()
            .chain(self.secret_values.keys())
            .cloned()
            .collect();
        sources.sort();
        sources
    }
}

/// One sorted name per line, trailing newline.
fn manifest(names: impl IntoIterator<Item = String>) -> Vec<u8> {
    let mut lines: Vec<String> = names.into_iter().collect();
    lines.sort();
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.into_bytes()
}

/// Plaintext env var names manifest (`env_keys.env`).
pub fn env_keys_manifest(env: &BTreeMap<String, String>) -> Vec<u8> {
    manifest(env.keys().cloned())
}

/// Credential sources manifest (`secrets.src`).
pub fn secret_sources_manifest(sources: &[String]) -> Vec<u8> {
    manifest(sources.iter().cloned())
}

/// Pack a code tree into a gzipped tar archive.
pub fn pack_archive(tree: &CodeTree) -> Result<Vec<u8>, KernelError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for file in &tree.files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_cksum();
        builder
            .append_data(&mut header, &file.path, file.contents.as_slice())
            .map_err(|e| KernelError::Bundle(format!("append {}: {e}", file.path)))?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| KernelError::Bundle(format!("finish archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| KernelError::Bundle(format!("finish gzip: {e}")))
}

/// Unpack a gzipped tar archive back into a code tree.
pub fn unpack_archive(bytes: &[u8]) -> Result<CodeTree, KernelError> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut files = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| KernelError::Bundle(format!("read archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| KernelError::Bundle(format!("read entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| KernelError::Bundle(format!("entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let mode = entry.header().mode().unwrap_or(0o644);
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| KernelError::Bundle(format!("read {path}: {e}")))?;
        files.push(CodeFile {
            path,
            mode,
            contents,
        });
    }
    Ok(CodeTree { files })
}
