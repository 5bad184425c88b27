pub mod augment;
pub mod batch;
pub mod indexer;
pub mod pairing;

use crate::config::{ExperimentConfig, PairLayout};
use crate::error::{Error, Result};
use augment::{AugmentationPipeline, AugmentationPolicy};
use batch::{
    DecodeCache, DecodePool, PairBatcher, PairedBatch, PairedDataset, TargetBatcher, TargetDataset,
};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::prelude::*;
use indexer::index_domain;
use pairing::{PairedCorpusBuilder, PairedExample, Repetition, TargetExample};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Settings for decoding and assembling image batches.
#[derive(Clone, Debug)]
pub struct DataConfig {
    pub resize: usize,
    pub batch_size: usize,
    pub num_classes: usize,
    /// Decode and augmentation threads; zero shares rayon's global pool.
    pub num_workers: usize,
    pub cache_decoded: bool,
    pub seed: u64,
}

impl DataConfig {
    pub fn from_experiment(config: &ExperimentConfig) -> Self {
        Self {
            resize: config.resize,
            batch_size: config.batch_size,
            num_classes: config.num_classes,
            num_workers: config.num_workers,
            cache_decoded: config.cache_decoded,
            seed: config.seed,
        }
    }
}

/// Indexed source/target corpora plus the batchers that feed the network.
#[derive(Clone, Debug)]
pub struct AdaptationData {
    builder: PairedCorpusBuilder,
    pair_batcher: PairBatcher,
    target_batcher: TargetBatcher,
    config: DataConfig,
}

impl AdaptationData {
    /// Index both domains of `layout` and prepare the per-stream pipelines.
    pub fn new(layout: &PairLayout, config: DataConfig) -> Result<Self> {
        let source = Arc::new(index_domain(&layout.source_root)?);
        let target = Arc::new(index_domain(&layout.target_root)?);

        for (domain, corpus) in [("source", &source), ("target", &target)] {
            if corpus.num_classes() > config.num_classes {
                return Err(Error::Configuration(format!(
                    "{domain} domain at {} has {} classes but num_classes is {}",
                    corpus.root.display(),
                    corpus.num_classes(),
                    config.num_classes
                )));
            }
        }
        if source.class_names != target.class_names {
            warn!("source and target class folders differ; labels are matched by position");
        }

        let builder = PairedCorpusBuilder::new(
            source,
            target,
            Repetition::from_flag(layout.repeat_source),
            config.seed,
        )?;

        let cache = if config.cache_decoded {
            DecodeCache::enabled()
        } else {
            DecodeCache::disabled()
        };
        let pool = DecodePool::from_workers(config.num_workers)?;
        let pair_batcher = PairBatcher::new(
            AugmentationPipeline::new(
                config.resize,
                layout.source_greyscale,
                layout.source_policy.clone(),
            )?,
            AugmentationPipeline::new(
                config.resize,
                layout.target_greyscale,
                layout.target_policy.clone(),
            )?,
            cache.clone(),
            pool.clone(),
            config.seed,
        );
        let target_batcher = TargetBatcher::new(
            AugmentationPipeline::new(
                config.resize,
                layout.target_greyscale,
                AugmentationPolicy::plain(),
            )?,
            cache,
            pool,
        );

        let data = Self {
            builder,
            pair_batcher,
            target_batcher,
            config,
        };
        info!(
            train_batches = data.train_batches(),
            target_batches = data.target_batches(),
            "data pipeline ready"
        );
        Ok(data)
    }

    pub fn builder(&self) -> &PairedCorpusBuilder {
        &self.builder
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn train_batches(&self) -> usize {
        self.builder.pairs_per_epoch().div_ceil(self.config.batch_size)
    }

    pub fn target_batches(&self) -> usize {
        self.builder.target().len().div_ceil(self.config.batch_size)
    }

    /// A fresh loader over this epoch's pairing.
    ///
    /// Pairing completes before the loader exists, so no step can observe a
    /// reshuffle in progress. The loader itself stays on one thread: only the
    /// trailing batch may be short, and batches arrive in stream order.
    pub fn train_loader<B: Backend>(
        &self,
        epoch: usize,
        device: &B::Device,
    ) -> Arc<dyn DataLoader<B, PairedBatch<B>>> {
        let pairs = self.builder.epoch(epoch);
        DataLoaderBuilder::<B, PairedExample, PairedBatch<B>>::new(self.pair_batcher.clone())
            .batch_size(self.config.batch_size)
            .set_device(device.clone())
            .build(PairedDataset::new(pairs))
    }

    /// Loader over the unrepeated target stream, each image filling both slots.
    pub fn target_loader<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Arc<dyn DataLoader<B, PairedBatch<B>>> {
        DataLoaderBuilder::<B, TargetExample, PairedBatch<B>>::new(self.target_batcher.clone())
            .batch_size(self.config.batch_size)
            .set_device(device.clone())
            .build(TargetDataset::new(self.builder.target_stream()))
    }

    /// Assemble a single duplicated-slot batch from held-out target samples.
    pub fn target_batch<B: Backend>(
        &self,
        examples: Vec<TargetExample>,
        device: &B::Device,
    ) -> PairedBatch<B> {
        Batcher::<B, TargetExample, PairedBatch<B>>::batch(&self.target_batcher, examples, device)
    }
}

/// Index the configured domain pair, failing before any model resource is created.
pub fn load_experiment_data(
    config: &ExperimentConfig,
    experiment_dir: &Path,
) -> Result<AdaptationData> {
    let layout = config.pair_layout(experiment_dir);
    info!(
        combination = %config.combination,
        source = %layout.source_root.display(),
        target = %layout.target_root.display(),
        "indexing domains"
    );
    AdaptationData::new(&layout, DataConfig::from_experiment(config))
}
