use crate::data::augment::AugmentationPipeline;
use crate::data::pairing::{mix, PairedExample, TargetExample};
use crate::error::{Error, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{DynamicImage, Rgb32FImage};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Decoded images keyed by sample path, filled before any stochastic stage.
#[derive(Clone, Debug, Default)]
pub struct DecodeCache {
    entries: Option<Arc<Mutex<HashMap<PathBuf, Arc<DynamicImage>>>>>,
}

impl DecodeCache {
    pub fn enabled() -> Self {
        Self {
            entries: Some(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn disabled() -> Self {
        Self { entries: None }
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().ok().map(|map| map.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the decoded image, reading and decoding it on a miss.
    pub fn load(&self, path: &Path) -> Result<Arc<DynamicImage>> {
        if let Some(entries) = &self.entries {
            if let Some(hit) = entries.lock().ok().and_then(|map| map.get(path).cloned()) {
                return Ok(hit);
            }
        }
        let image = Arc::new(decode_image(path)?);
        if let Some(entries) = &self.entries {
            if let Ok(mut map) = entries.lock() {
                map.insert(path.to_path_buf(), image.clone());
            }
        }
        Ok(image)
    }
}

/// Threads that decode and augment the samples of one batch.
///
/// Results always come back in item order, so batches keep stream order.
#[derive(Clone, Debug, Default)]
pub struct DecodePool {
    pool: Option<Arc<ThreadPool>>,
}

impl DecodePool {
    /// Share rayon's global pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("coral-decode-{index}"))
            .build()
            .map_err(|err| Error::Configuration(format!("decode pool: {err}")))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Zero picks rayon's global pool.
    pub fn from_workers(workers: usize) -> Result<Self> {
        if workers == 0 {
            Ok(Self::global())
        } else {
            Self::with_threads(workers)
        }
    }

    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(|| items.par_iter().map(&f).collect()),
            None => items.par_iter().map(&f).collect(),
        }
    }
}

/// Read raw bytes and decode them into an image.
pub fn decode_image(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path).map_err(|err| Error::Decode {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    image::load_from_memory(&bytes).map_err(|err| Error::Decode {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Two synchronized NCHW image streams plus labels.
///
/// For training the labels come from the source stream only; for the
/// target-only stream both slots hold the same image.
#[derive(Clone, Debug)]
pub struct PairedBatch<B: Backend> {
    pub source: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> PairedBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One epoch's paired examples.
#[derive(Clone, Debug)]
pub struct PairedDataset {
    pairs: Vec<PairedExample>,
}

impl PairedDataset {
    pub fn new(pairs: Vec<PairedExample>) -> Self {
        Self { pairs }
    }
}

impl Dataset<PairedExample> for PairedDataset {
    fn get(&self, index: usize) -> Option<PairedExample> {
        self.pairs.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}

#[derive(Clone, Debug)]
pub struct TargetDataset {
    examples: Vec<TargetExample>,
}

impl TargetDataset {
    pub fn new(examples: Vec<TargetExample>) -> Self {
        Self { examples }
    }
}

impl Dataset<TargetExample> for TargetDataset {
    fn get(&self, index: usize) -> Option<TargetExample> {
        self.examples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

/// Decodes and augments the two halves of each pair with their own pipelines.
#[derive(Clone, Debug)]
pub struct PairBatcher {
    source: AugmentationPipeline,
    target: AugmentationPipeline,
    cache: DecodeCache,
    pool: DecodePool,
    seed: u64,
}

impl PairBatcher {
    pub fn new(
        source: AugmentationPipeline,
        target: AugmentationPipeline,
        cache: DecodeCache,
        pool: DecodePool,
        seed: u64,
    ) -> Self {
        Self {
            source,
            target,
            cache,
            pool,
            seed,
        }
    }

    /// Augmentation rng for one pair, recoverable from the pairing indices.
    fn rng_for(&self, pair: &PairedExample) -> StdRng {
        let key = mix(self.seed ^ pair.epoch as u64)
            ^ mix(((pair.source_index as u64) << 32) | pair.target_index as u64);
        StdRng::seed_from_u64(mix(key))
    }

    fn prepare(&self, pair: &PairedExample) -> Result<(Vec<f32>, Vec<f32>)> {
        let source = self.cache.load(&pair.source)?;
        let target = self.cache.load(&pair.target)?;
        let mut rng = self.rng_for(pair);
        Ok((
            image_to_chw(&self.source.apply(&source, &mut rng)),
            image_to_chw(&self.target.apply(&target, &mut rng)),
        ))
    }
}

impl<B: Backend> Batcher<B, PairedExample, PairedBatch<B>> for PairBatcher {
    fn batch(&self, items: Vec<PairedExample>, device: &B::Device) -> PairedBatch<B> {
        let size = self.source.resize();
        let mut source = Vec::with_capacity(items.len() * 3 * size * size);
        let mut target = Vec::with_capacity(items.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(items.len());

        let prepared = self.pool.map(&items, |pair| self.prepare(pair));
        for (pair, result) in items.iter().zip(prepared) {
            match result {
                Ok((src, tgt)) => {
                    source.extend(src);
                    target.extend(tgt);
                    labels.push(pair.label as i64);
                }
                Err(err) => warn!(%err, "skipping pair"),
            }
        }

        assemble(source, target, labels, size, device)
    }
}

/// Duplicates each target image into both slots of the merged network.
#[derive(Clone, Debug)]
pub struct TargetBatcher {
    pipeline: AugmentationPipeline,
    cache: DecodeCache,
    pool: DecodePool,
}

impl TargetBatcher {
    pub fn new(pipeline: AugmentationPipeline, cache: DecodeCache, pool: DecodePool) -> Self {
        Self {
            pipeline,
            cache,
            pool,
        }
    }

    fn prepare(&self, item: &TargetExample) -> Result<Vec<f32>> {
        let image = self.cache.load(&item.sample.path)?;
        let mut rng = StdRng::seed_from_u64(mix(item.index as u64));
        Ok(image_to_chw(&self.pipeline.apply(&image, &mut rng)))
    }
}

impl<B: Backend> Batcher<B, TargetExample, PairedBatch<B>> for TargetBatcher {
    fn batch(&self, items: Vec<TargetExample>, device: &B::Device) -> PairedBatch<B> {
        let size = self.pipeline.resize();
        let mut images = Vec::with_capacity(items.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(items.len());

        let prepared = self.pool.map(&items, |item| self.prepare(item));
        for (item, result) in items.iter().zip(prepared) {
            match result {
                Ok(chw) => {
                    images.extend(chw);
                    labels.push(item.sample.label as i64);
                }
                Err(err) => warn!(%err, "skipping target sample"),
            }
        }

        assemble(images.clone(), images, labels, size, device)
    }
}

fn assemble<B: Backend>(
    source: Vec<f32>,
    target: Vec<f32>,
    labels: Vec<i64>,
    size: usize,
    device: &B::Device,
) -> PairedBatch<B> {
    let batch_size = labels.len();
    let shape = [batch_size, 3, size, size];
    PairedBatch {
        source: Tensor::<B, 4>::from_data(TensorData::new(source, shape), device),
        target: Tensor::<B, 4>::from_data(TensorData::new(target, shape), device),
        labels: Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device),
    }
}

/// Convert HWC float pixels to a CHW vector.
fn image_to_chw(img: &Rgb32FImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        out[idx] = pixel.0[0];
        out[hw + idx] = pixel.0[1];
        out[2 * hw + idx] = pixel.0[2];
    }

    out
}
