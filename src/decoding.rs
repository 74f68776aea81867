//! Sampling by simulate-then-decode.
//!
//! A [`DetectionSource`] produces, for each shot, which detectors fired and
//! which observables actually flipped. A [`Decoder`] predicts the observable
//! flips from the detector record alone. [`DecodingSampler`] glues the two
//! into a [`Sampler`]: a shot is *discarded* if a detector covered by the
//! task's discard mask fired, an *error* if the prediction disagrees with
//! the actual observables, and a success otherwise.
//!
//! Records are bit-packed, one fixed-width record per shot, `ceil(bits / 8)`
//! bytes each, with bit `i` stored in byte `i / 8` at position `i % 8`.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{CollectError, Result};
use crate::sampler::{CompiledSampler, Sampler};
use crate::stats::Stats;
use crate::task::{Artifact, DiscardMask, TaskDescriptor};

/// Bytes needed to store one record of `bits` bits.
pub fn record_stride(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// A table of equally sized bit-packed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedRecords {
    data: Vec<u8>,
    bits: usize,
    len: usize,
}

impl PackedRecords {
    pub fn new(bits: usize) -> Self {
        Self {
            data: Vec::new(),
            bits,
            len: 0,
        }
    }

    /// Wrap `len` records stored back to back in `data`.
    pub fn from_bytes(data: Vec<u8>, bits: usize, len: usize) -> Result<Self> {
        let expected = record_stride(bits) * len;
        if data.len() != expected {
            return Err(CollectError::Sampling(format!(
                "{len} records of {bits} bits need {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { data, bits, len })
    }

    /// Append a record given as its set bit indices.
    pub fn push_indices(&mut self, indices: impl IntoIterator<Item = usize>) -> Result<()> {
        let stride = record_stride(self.bits);
        let start = self.data.len();
        self.data.resize(start + stride, 0);
        for i in indices {
            if i >= self.bits {
                self.data.truncate(start);
                return Err(CollectError::Sampling(format!(
                    "bit {i} out of range for {}-bit records",
                    self.bits
                )));
            }
            self.data[start + i / 8] |= 1 << (i % 8);
        }
        self.len += 1;
        Ok(())
    }

    /// Append an already packed record.
    pub fn push_packed(&mut self, record: &[u8]) -> Result<()> {
        if record.len() != record_stride(self.bits) {
            return Err(CollectError::Sampling(format!(
                "packed record has {} bytes, expected {}",
                record.len(),
                record_stride(self.bits)
            )));
        }
        self.data.extend_from_slice(record);
        self.len += 1;
        Ok(())
    }

    pub fn record(&self, index: usize) -> Option<&[u8]> {
        let stride = record_stride(self.bits);
        (index < self.len).then(|| &self.data[index * stride..(index + 1) * stride])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        let stride = record_stride(self.bits);
        (0..self.len).map(move |i| &self.data[i * stride..(i + 1) * stride])
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Whether bit `index` is set in a packed record.
pub fn bit(record: &[u8], index: usize) -> bool {
    record
        .get(index / 8)
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

/// Detector and observable data for a batch of shots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detections {
    pub detectors: PackedRecords,
    pub observables: PackedRecords,
}

/// Simulator factory, compiled once per task per worker.
pub trait DetectionSource: Send + Sync {
    fn compile(&self, workload: &Artifact) -> Result<Box<dyn CompiledDetectionSource>>;
}

pub trait CompiledDetectionSource: Send {
    /// Simulate exactly `shots` shots.
    fn sample(&mut self, shots: u64) -> Result<Detections>;
}

/// Decoder factory. `model` is the task's decoder model when it has one,
/// otherwise its workload.
pub trait Decoder: Send + Sync {
    fn compile(&self, model: &Artifact) -> Result<Box<dyn CompiledDecoder>>;
}

pub trait CompiledDecoder: Send {
    /// Predict the observable flips of every detector record.
    ///
    /// Must return one record of `num_observables` bits per input record.
    fn decode_batch(&mut self, detectors: &PackedRecords) -> Result<PackedRecords>;
}

/// [`Sampler`] built from a detection source and a decoder.
#[derive(Clone)]
pub struct DecodingSampler {
    source: Arc<dyn DetectionSource>,
    decoder: Arc<dyn Decoder>,
}

impl DecodingSampler {
    pub fn new(source: impl DetectionSource + 'static, decoder: impl Decoder + 'static) -> Self {
        Self {
            source: Arc::new(source),
            decoder: Arc::new(decoder),
        }
    }
}

impl Sampler for DecodingSampler {
    fn compile(&self, task: &TaskDescriptor) -> Result<Box<dyn CompiledSampler>> {
        let workload = task.workload();
        let model = task.model().unwrap_or(workload);
        Ok(Box::new(CompiledDecodingSampler {
            source: self.source.compile(workload)?,
            decoder: self.decoder.compile(model)?,
            mask: task.discard_mask().cloned(),
            num_detectors: workload.num_detectors,
            num_observables: workload.num_observables,
        }))
    }
}

struct CompiledDecodingSampler {
    source: Box<dyn CompiledDetectionSource>,
    decoder: Box<dyn CompiledDecoder>,
    mask: Option<DiscardMask>,
    num_detectors: usize,
    num_observables: usize,
}

impl CompiledSampler for CompiledDecodingSampler {
    fn sample(&mut self, suggested_shots: u64) -> Result<Stats> {
        let shots = suggested_shots.max(1);
        let start = Instant::now();
        let detections = self.source.sample(shots)?;
        check_shape(
            &detections,
            shots,
            self.num_detectors,
            self.num_observables,
        )?;

        let classified = classify(&detections, self.mask.as_ref(), self.decoder.as_mut())?;
        Ok(Stats::new(
            shots,
            classified.errors,
            classified.discards,
            start.elapsed(),
        ))
    }
}

fn check_shape(
    detections: &Detections,
    shots: u64,
    num_detectors: usize,
    num_observables: usize,
) -> Result<()> {
    let Detections {
        detectors,
        observables,
    } = detections;
    if detectors.len() as u64 != shots || observables.len() as u64 != shots {
        return Err(CollectError::Sampling(format!(
            "detection source returned {} detector and {} observable records for {shots} shots",
            detectors.len(),
            observables.len()
        )));
    }
    if detectors.bits() != num_detectors || observables.bits() != num_observables {
        return Err(CollectError::Sampling(format!(
            "detection source records are {}x{} bits, task expects {num_detectors}x{num_observables}",
            detectors.bits(),
            observables.bits()
        )));
    }
    Ok(())
}

/// Per-batch shot classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub errors: u64,
    pub discards: u64,
}

/// Drop masked shots, decode the rest and count mispredictions.
pub fn classify(
    detections: &Detections,
    mask: Option<&DiscardMask>,
    decoder: &mut dyn CompiledDecoder,
) -> Result<Classification> {
    let mut kept_detectors = PackedRecords::new(detections.detectors.bits());
    let mut kept_observables = Vec::new();
    let mut discards = 0;

    for (dets, obs) in detections
        .detectors
        .iter()
        .zip(detections.observables.iter())
    {
        if mask.is_some_and(|m| m.intersects(dets)) {
            discards += 1;
            continue;
        }
        kept_detectors.push_packed(dets)?;
        kept_observables.push(obs);
    }

    if kept_detectors.is_empty() {
        return Ok(Classification {
            errors: 0,
            discards,
        });
    }

    let predictions = decoder.decode_batch(&kept_detectors)?;
    if predictions.len() != kept_detectors.len()
        || predictions.bits() != detections.observables.bits()
    {
        return Err(CollectError::Sampling(format!(
            "decoder returned {} predictions of {} bits for {} shots of {} observables",
            predictions.len(),
            predictions.bits(),
            kept_detectors.len(),
            detections.observables.bits()
        )));
    }

    let errors = predictions
        .iter()
        .zip(kept_observables)
        .filter(|(predicted, actual)| predicted != actual)
        .count() as u64;

    Ok(Classification { errors, discards })
}
