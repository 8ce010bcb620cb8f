//! Run directory layout and artifact stores.
//!
//! ```text
//! <run>/
//! ├── config_used.toml
//! ├── state/runstate.db
//! ├── payloads/<id>.bin, payloads/<id>.json
//! ├── converted/<id>.json, converted/<id>.md
//! ├── ledger.jsonl
//! ├── filter/decisions.jsonl
//! ├── chunks/<tree>/<id>/NNNN.md, chunks/<tree>/<id>/chunks.json
//! ├── chunks.jsonl
//! ├── chunk_summary.json
//! └── manifest.json
//! ```
//!
//! Every file is written through [`write_atomic`], so a crash leaves either
//! the previous version or the new one, never a torn file.
//!
//! `ledger.jsonl` and `filter/decisions.jsonl` are attempt logs, appended
//! before the unit outcome is recorded. A unit that is retried, resumed
//! after a crash, or re-evaluated gets a new line each time. Readers take
//! the last line per resource; the state database stays authoritative.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use coursepipe_shared::{Chunk, ConvertedDocument, PipelineError, RawPayload, ResourceId, Result};

/// Paths inside one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_used(&self) -> PathBuf {
        self.root.join("config_used.toml")
    }

    pub fn state_db(&self) -> PathBuf {
        self.root.join("state").join("runstate.db")
    }

    pub fn payload_bin(&self, id: &ResourceId) -> PathBuf {
        self.root.join("payloads").join(format!("{id}.bin"))
    }

    pub fn payload_meta(&self, id: &ResourceId) -> PathBuf {
        self.root.join("payloads").join(format!("{id}.json"))
    }

    pub fn converted_json(&self, id: &ResourceId) -> PathBuf {
        self.root.join("converted").join(format!("{id}.json"))
    }

    pub fn converted_md(&self, id: &ResourceId) -> PathBuf {
        self.root.join("converted").join(format!("{id}.md"))
    }

    /// One line per converter attempt, across every invocation of the run.
    pub fn ledger(&self) -> PathBuf {
        self.root.join("ledger.jsonl")
    }

    /// One line per filter evaluation; the last line for an id is current.
    pub fn filter_decisions(&self) -> PathBuf {
        self.root.join("filter").join("decisions.jsonl")
    }

    pub fn chunks_root(&self) -> PathBuf {
        self.root.join("chunks")
    }

    /// Directory for one resource's chunks, `tree` being its course path.
    pub fn chunk_dir(&self, tree: &Path, id: &ResourceId) -> PathBuf {
        self.chunks_root().join(tree).join(id.as_str())
    }

    pub fn chunks_jsonl(&self) -> PathBuf {
        self.root.join("chunks.jsonl")
    }

    pub fn chunk_summary(&self) -> PathBuf {
        self.root.join("chunk_summary.json")
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest.json")
    }
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Write `bytes` to `path` via a sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::Storage(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp-{}", Uuid::now_v7()));

    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| PipelineError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| PipelineError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PipelineError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| PipelineError::Storage(format!("JSON serialization failed: {e}")))?;
    write_atomic(path, json.as_bytes())?;
    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}

/// Write one JSON document per line, atomically.
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut out = String::new();
    for row in rows {
        let line = serde_json::to_string(row)
            .map_err(|e| PipelineError::Storage(format!("JSON serialization failed: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}

/// Read a JSON file written by [`write_json`]. A missing or malformed file
/// means the run directory no longer matches its state database.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::RunStateCorrupt(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PipelineError::RunStateCorrupt(format!("malformed {}: {e}", path.display()))
    })
}

/// Append one JSON line to `path`.
pub fn append_jsonl<T: Serialize>(path: &Path, row: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let mut line = serde_json::to_string(row)
        .map_err(|e| PipelineError::Storage(format!("JSON serialization failed: {e}")))?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PipelineError::io(path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| PipelineError::io(path, e))
}

/// Read every line appended by [`append_jsonl`]. A missing file reads as
/// empty; an unterminated last line (an interrupted append) is ignored.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => "",
    };
    complete
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                PipelineError::RunStateCorrupt(format!("malformed line in {}: {e}", path.display()))
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Payload archive
// ---------------------------------------------------------------------------

/// Sidecar metadata stored next to each payload's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub resource_id: ResourceId,
    pub mime_type: String,
    pub content_hash: String,
    pub size: usize,
}

impl RunLayout {
    /// Archive a payload. Bytes land before the sidecar, so a sidecar always
    /// describes bytes that exist.
    pub fn save_payload(&self, payload: &RawPayload) -> Result<()> {
        write_atomic(&self.payload_bin(&payload.resource_id), &payload.bytes)?;
        write_json(
            &self.payload_meta(&payload.resource_id),
            &PayloadMeta {
                resource_id: payload.resource_id.clone(),
                mime_type: payload.mime_type.clone(),
                content_hash: payload.content_hash.clone(),
                size: payload.bytes.len(),
            },
        )
    }

    /// Load an archived payload and check it against its recorded hash.
    pub fn load_payload(&self, id: &ResourceId) -> Result<RawPayload> {
        let meta: PayloadMeta = read_json(&self.payload_meta(id))?;
        let path = self.payload_bin(id);
        let bytes = std::fs::read(&path).map_err(|e| {
            PipelineError::RunStateCorrupt(format!("cannot read {}: {e}", path.display()))
        })?;
        let payload = RawPayload::new(id.clone(), meta.mime_type, bytes);
        if payload.content_hash != meta.content_hash {
            return Err(PipelineError::RunStateCorrupt(format!(
                "payload {id} does not match its recorded hash"
            )));
        }
        Ok(payload)
    }

    // -----------------------------------------------------------------------
    // Converted documents
    // -----------------------------------------------------------------------

    pub fn save_converted(&self, doc: &ConvertedDocument) -> Result<()> {
        write_atomic(&self.converted_md(&doc.resource_id), doc.markdown.as_bytes())?;
        write_json(&self.converted_json(&doc.resource_id), doc)
    }

    pub fn load_converted(&self, id: &ResourceId) -> Result<ConvertedDocument> {
        read_json(&self.converted_json(id))
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Replace a resource's chunk directory with `chunks` and, when given,
    /// one rendered Markdown file per chunk.
    pub fn save_chunks(
        &self,
        tree: &Path,
        id: &ResourceId,
        chunks: &[Chunk],
        rendered: Option<&[String]>,
    ) -> Result<()> {
        let dir = self.chunk_dir(tree, id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        }
        if let Some(files) = rendered {
            for (chunk, body) in chunks.iter().zip(files) {
                write_atomic(
                    &dir.join(format!("{:04}.md", chunk.chunk_index)),
                    body.as_bytes(),
                )?;
            }
        }
        // Written last: its presence marks the set complete.
        write_json(&dir.join("chunks.json"), chunks)
    }

    pub fn load_chunks(&self, tree: &Path, id: &ResourceId) -> Result<Vec<Chunk>> {
        read_json(&self.chunk_dir(tree, id).join("chunks.json"))
    }

    /// Delete a resource's chunk directory. Missing directories are fine.
    pub fn remove_chunks(&self, tree: &Path, id: &ResourceId) -> Result<()> {
        let dir = self.chunk_dir(tree, id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(&dir, e)),
        }
    }
}
