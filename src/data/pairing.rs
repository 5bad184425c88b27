use crate::data::indexer::{DomainCorpus, Sample};
use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const SOURCE_STREAM: u64 = 0x5352_4300;
const TARGET_STREAM: u64 = 0x5447_5400;
const EVAL_STREAM: u64 = 0x4556_4c00;

/// Which side of the pair is extended to cover the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Repetition {
    /// Materialize the shuffled source list `r` times back to back.
    Source,
    /// Cycle the shuffled target list lazily while zipping.
    Target,
}

impl Repetition {
    pub fn from_flag(repeat_source: bool) -> Self {
        if repeat_source {
            Repetition::Source
        } else {
            Repetition::Target
        }
    }
}

/// One training step's worth of pairing: a source sample, a target image and the source label.
///
/// The target label is deliberately absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairedExample {
    pub source: PathBuf,
    pub target: PathBuf,
    pub label: usize,
    pub source_index: usize,
    pub target_index: usize,
    pub epoch: usize,
}

/// A target sample of the unpaired evaluation stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetExample {
    pub sample: Sample,
    pub index: usize,
}

/// Builds the per-epoch 1:1 correspondence between two corpora of unequal size.
#[derive(Clone, Debug)]
pub struct PairedCorpusBuilder {
    source: Arc<DomainCorpus>,
    target: Arc<DomainCorpus>,
    repetition: Repetition,
    seed: u64,
    eval_order: Vec<usize>,
}

impl PairedCorpusBuilder {
    pub fn new(
        source: Arc<DomainCorpus>,
        target: Arc<DomainCorpus>,
        repetition: Repetition,
        seed: u64,
    ) -> Result<Self> {
        if source.is_empty() {
            return Err(Error::EmptyCorpus { domain: "source" });
        }
        if target.is_empty() {
            return Err(Error::EmptyCorpus { domain: "target" });
        }

        // Shuffled once and cached; the evaluation stream is never repeated.
        let mut eval_order: Vec<usize> = (0..target.len()).collect();
        eval_order.shuffle(&mut StdRng::seed_from_u64(stream_seed(seed, 0, EVAL_STREAM)));

        let builder = Self {
            source,
            target,
            repetition,
            seed,
            eval_order,
        };
        info!(
            source = builder.source.len(),
            target = builder.target.len(),
            repetition = ?builder.repetition,
            factor = builder.repetition_factor(),
            "paired corpus ready"
        );
        Ok(builder)
    }

    pub fn source(&self) -> &DomainCorpus {
        &self.source
    }

    pub fn target(&self) -> &DomainCorpus {
        &self.target
    }

    pub fn repetition(&self) -> Repetition {
        self.repetition
    }

    /// `ceil(len(longer) / len(shorter))`.
    pub fn repetition_factor(&self) -> usize {
        let (a, b) = (self.source.len(), self.target.len());
        let (longer, shorter) = if a >= b { (a, b) } else { (b, a) };
        (longer + shorter - 1) / shorter
    }

    /// Number of paired examples every epoch yields.
    pub fn pairs_per_epoch(&self) -> usize {
        match self.repetition {
            Repetition::Source => self.target.len(),
            Repetition::Target => self.source.len(),
        }
    }

    /// Reshuffle both streams and re-pair them for `epoch`.
    ///
    /// Source and target use independent orderings, so pairs carry no
    /// instance correspondence between domains.
    pub fn epoch(&self, epoch: usize) -> Vec<PairedExample> {
        let source_seed = stream_seed(self.seed, epoch, SOURCE_STREAM);
        let target_seed = stream_seed(self.seed, epoch, TARGET_STREAM);
        let source_order = shuffled(self.source.len(), source_seed);
        let target_order = shuffled(self.target.len(), target_seed);

        let indices: Vec<(usize, usize)> = if self.source.len() == self.target.len() {
            source_order.into_iter().zip(target_order).collect()
        } else {
            match self.repetition {
                Repetition::Source => {
                    let factor = self.repetition_factor();
                    let mut extended = Vec::with_capacity(source_order.len() * factor);
                    for _ in 0..factor {
                        extended.extend_from_slice(&source_order);
                    }
                    extended.truncate(target_order.len());
                    extended.into_iter().zip(target_order).collect()
                }
                Repetition::Target => source_order
                    .into_iter()
                    .zip(target_order.into_iter().cycle())
                    .collect(),
            }
        };

        indices
            .into_iter()
            .map(|(source_index, target_index)| self.pair(source_index, target_index, epoch))
            .collect()
    }

    /// Recover the paired example for a (source, target) index pair.
    pub fn pair(&self, source_index: usize, target_index: usize, epoch: usize) -> PairedExample {
        let source = &self.source.samples[source_index];
        PairedExample {
            source: source.path.clone(),
            target: self.target.samples[target_index].path.clone(),
            label: source.label,
            source_index,
            target_index,
            epoch,
        }
    }

    /// The unrepeated, shuffled target corpus.
    pub fn target_stream(&self) -> Vec<TargetExample> {
        self.eval_order
            .iter()
            .map(|&index| TargetExample {
                sample: self.target.samples[index].clone(),
                index,
            })
            .collect()
    }

    /// Leading `fraction` of the target stream, used by the custom evaluation hook.
    pub fn validation_slice(&self, fraction: f64) -> Vec<TargetExample> {
        let count = ((self.eval_order.len() as f64) * fraction).round() as usize;
        let mut stream = self.target_stream();
        stream.truncate(count.min(stream.len()));
        stream
    }
}

fn shuffled(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    order
}

/// Derive an independent seed for one stream of one epoch.
pub fn stream_seed(seed: u64, epoch: usize, stream: u64) -> u64 {
    mix(mix(seed ^ stream).wrapping_add(epoch as u64))
}

/// SplitMix64 finalizer.
pub fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
