//! Task descriptors and their content-addressed identity.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::{CollectError, Result};
use crate::options::CollectionOptions;

/// An opaque serializable blob handed to samplers, plus the shape information
/// the engine needs to validate masks and models against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub payload: Value,
    pub num_detectors: usize,
    pub num_observables: usize,
}

impl Artifact {
    pub fn new(payload: Value, num_detectors: usize, num_observables: usize) -> Self {
        Self {
            payload,
            num_detectors,
            num_observables,
        }
    }
}

/// Fixed-width bitmask over detectors; a shot in which any masked detector
/// fired is discarded instead of scored.
///
/// Bits are packed little-endian within each byte, matching the record
/// layout in [`crate::decoding`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardMask {
    bits: Vec<u8>,
    len: usize,
}

impl DiscardMask {
    /// Build a mask from packed bytes covering exactly `len` bits.
    pub fn from_packed(bits: Vec<u8>, len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bits.len() != expected {
            return Err(CollectError::InvalidTask(format!(
                "discard mask for {len} bits needs {expected} bytes, got {}",
                bits.len()
            )));
        }
        if len % 8 != 0 {
            let padding = bits[expected - 1] >> (len % 8);
            if padding != 0 {
                return Err(CollectError::InvalidTask(format!(
                    "discard mask sets bits beyond its width of {len}"
                )));
            }
        }
        Ok(Self { bits, len })
    }

    /// Build a mask with the given bit indices set.
    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Result<Self> {
        let mut bits = vec![0u8; len.div_ceil(8)];
        for i in indices {
            if i >= len {
                return Err(CollectError::InvalidTask(format!(
                    "discard mask index {i} out of range for width {len}"
                )));
            }
            bits[i / 8] |= 1 << (i % 8);
        }
        Ok(Self { bits, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn is_set(&self, i: usize) -> bool {
        i < self.len && self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    /// Whether any masked bit is set in a packed record of the same width.
    pub fn intersects(&self, record: &[u8]) -> bool {
        self.bits.iter().zip(record).any(|(m, r)| m & r != 0)
    }
}

/// One sampling problem: what to sample, how to decode it, and when to stop.
///
/// Descriptors are immutable. The builder-style `with_*` methods consume the
/// descriptor and return a new one, validating as they go, so an invalid
/// descriptor can never be observed.
///
/// The strong id is a SHA-256 over the canonical JSON of everything that
/// affects the sampled statistics (workload, model, decoder, discard mask and
/// metadata). Collection options are deliberately excluded: changing how long
/// to sample does not change what is being sampled.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    workload: Artifact,
    model: Option<Artifact>,
    decoder: Option<String>,
    discard_mask: Option<DiscardMask>,
    metadata: Value,
    options: CollectionOptions,
    strong_id: OnceLock<String>,
}

impl TaskDescriptor {
    pub fn new(workload: Artifact) -> Self {
        Self {
            workload,
            model: None,
            decoder: None,
            discard_mask: None,
            metadata: Value::Null,
            options: CollectionOptions::default(),
            strong_id: OnceLock::new(),
        }
    }

    /// Attach a pre-derived decoder model; its shape must match the workload.
    pub fn with_model(self, model: Artifact) -> Result<Self> {
        if model.num_detectors != self.workload.num_detectors
            || model.num_observables != self.workload.num_observables
        {
            return Err(CollectError::InvalidTask(format!(
                "model has {} detectors and {} observables but the workload has {} and {}",
                model.num_detectors,
                model.num_observables,
                self.workload.num_detectors,
                self.workload.num_observables
            )));
        }
        Ok(self.rebuild(|t| t.model = Some(model)))
    }

    pub fn with_decoder(self, decoder: impl Into<String>) -> Self {
        let decoder = decoder.into();
        self.rebuild(|t| t.decoder = Some(decoder))
    }

    /// Attach a discard mask; its width must equal the workload's detector count.
    pub fn with_discard_mask(self, mask: DiscardMask) -> Result<Self> {
        if mask.len() != self.workload.num_detectors {
            return Err(CollectError::InvalidTask(format!(
                "discard mask covers {} detectors but the workload has {}",
                mask.len(),
                self.workload.num_detectors
            )));
        }
        Ok(self.rebuild(|t| t.discard_mask = Some(mask)))
    }

    pub fn with_metadata(self, metadata: Value) -> Self {
        self.rebuild(|t| t.metadata = metadata)
    }

    pub fn with_options(self, options: CollectionOptions) -> Result<Self> {
        options.validate()?;
        Ok(self.rebuild(|t| t.options = options))
    }

    fn rebuild(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self.strong_id = OnceLock::new();
        self
    }

    pub fn workload(&self) -> &Artifact {
        &self.workload
    }

    pub fn model(&self) -> Option<&Artifact> {
        self.model.as_ref()
    }

    pub fn decoder(&self) -> Option<&str> {
        self.decoder.as_deref()
    }

    pub fn discard_mask(&self) -> Option<&DiscardMask> {
        self.discard_mask.as_ref()
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    /// The task's own options folded with `global` (field-wise minimum).
    pub fn effective_options(&self, global: &CollectionOptions) -> CollectionOptions {
        self.options.combine(global)
    }

    /// The JSON value the strong id is computed from.
    pub fn identity(&self) -> Result<Value> {
        let decoder = self.decoder.as_deref().ok_or(CollectError::MissingDecoder)?;
        let mask = self.discard_mask.as_ref().map(|m| {
            json!({
                "len": m.len(),
                "bits": hex::encode(m.as_bytes()),
            })
        });
        Ok(json!({
            "workload": self.workload,
            "model": self.model,
            "decoder": decoder,
            "discard_mask": mask,
            "metadata": self.metadata,
        }))
    }

    /// Deterministic content hash of the task, computed once and cached.
    pub fn strong_id(&self) -> Result<&str> {
        if let Some(id) = self.strong_id.get() {
            return Ok(id.as_str());
        }
        let identity = self.identity()?;
        let digest = Sha256::digest(canonical_json(&identity).as_bytes());
        Ok(self.strong_id.get_or_init(|| hex::encode(digest)).as_str())
    }

    /// Convenience for handing the descriptor to worker threads.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Render `value` as JSON with object keys sorted and no whitespace.
///
/// Independent of serde_json's `preserve_order` feature, so the output only
/// depends on the logical value.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json's string escaping is already canonical
    out.push_str(&Value::String(s.to_owned()).to_string());
}
