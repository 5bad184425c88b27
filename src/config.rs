use crate::data::augment::AugmentationPolicy;
use crate::error::Error;
use crate::model::ModelConfig;
use burn::config::Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The only run mode this trainer accepts.
pub const EXPECTED_MODE: &str = "train_test";

/// Supported source → target dataset combinations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainPair {
    #[serde(alias = "Amazon_to_Webcam")]
    AmazonToWebcam,
    #[serde(alias = "Amazon_to_DSLR")]
    AmazonToDslr,
    #[serde(alias = "Webcam_to_Amazon")]
    WebcamToAmazon,
    #[serde(alias = "Webcam_to_DSLR")]
    WebcamToDslr,
    #[serde(alias = "DSLR_to_Amazon")]
    DslrToAmazon,
    #[serde(alias = "DSLR_to_Webcam")]
    DslrToWebcam,
    #[serde(alias = "MNIST_to_MNISTM")]
    MnistToMnistM,
    #[serde(alias = "MNISTM_to_MNIST")]
    MnistMToMnist,
    #[serde(alias = "SynSigns_to_GTSRB")]
    SynSignsToGtsrb,
}

/// Backbone family used to size both feature branches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(alias = "ALexNet")]
    AlexNet,
    Vgg16,
    Xception,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFunction {
    #[serde(rename = "CORAL", alias = "Coral", alias = "coral")]
    Coral,
}

/// Storage roots for the dataset families, replacing process-wide path constants.
#[derive(Config, Debug)]
pub struct DataRoots {
    #[config(default = "\"data/office\".to_string()")]
    pub office: String,
    #[config(default = "\"data/digits\".to_string()")]
    pub digits: String,
    #[config(default = "\"data/synthetic\".to_string()")]
    pub synthetic: String,
}

/// Everything a domain pair needs to build its paired corpus and pipelines.
#[derive(Clone, Debug)]
pub struct PairLayout {
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    /// Extend the source list by whole-list repetition instead of cycling the target.
    pub repeat_source: bool,
    pub source_greyscale: bool,
    pub target_greyscale: bool,
    pub source_policy: AugmentationPolicy,
    pub target_policy: AugmentationPolicy,
}

/// Experiment configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub combination: DomainPair,
    pub architecture: Architecture,
    #[config(default = "LossFunction::Coral")]
    pub loss_function: LossFunction,
    #[config(default = 0.25)]
    pub lambda_loss: f64,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 64)]
    pub resize: usize,
    #[config(default = 10)]
    pub epochs: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    pub num_classes: usize,
    #[config(default = 256)]
    pub feature_width: usize,
    /// When false the run is the source-only baseline without alignment.
    #[config(default = true)]
    pub technique: bool,
    #[config(default = false)]
    pub prune: bool,
    #[config(default = 0.5)]
    pub prune_val: f64,
    #[config(default = false)]
    pub save_model: bool,
    #[config(default = false)]
    pub use_multi_gpu: bool,
    #[config(default = "EXPECTED_MODE.to_string()")]
    pub mode: String,
    #[config(default = 42)]
    pub seed: u64,
    /// Decode and augmentation threads; zero shares rayon's global pool.
    #[config(default = 0)]
    pub num_workers: usize,
    #[config(default = true)]
    pub cache_decoded: bool,
    /// Fraction of the target stream held out for the custom evaluation hook.
    #[config(default = 0.1)]
    pub validation_split: f64,
    pub roots: DataRoots,
    pub source_augmentation: Option<AugmentationPolicy>,
    pub target_augmentation: Option<AugmentationPolicy>,
}

impl ExperimentConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let config = Self::load(path).map_err(|err| {
            Error::Configuration(format!("failed to load {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.mode.eq_ignore_ascii_case(EXPECTED_MODE) {
            return Err(Error::Configuration(format!(
                "mode must be '{EXPECTED_MODE}', got '{}'",
                self.mode
            )));
        }
        let positive = [
            ("batch_size", self.batch_size),
            ("resize", self.resize),
            ("epochs", self.epochs),
            ("num_classes", self.num_classes),
            ("feature_width", self.feature_width),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be positive")));
            }
        }
        if !self.lambda_loss.is_finite() || self.lambda_loss < 0.0 {
            return Err(Error::Configuration(format!(
                "lambda_loss must be a non-negative number, got {}",
                self.lambda_loss
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::Configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(Error::Configuration(format!(
                "validation_split must lie in [0, 1), got {}",
                self.validation_split
            )));
        }
        if self.prune && !(0.0..1.0).contains(&self.prune_val) {
            return Err(Error::Configuration(format!(
                "prune_val must lie in [0, 1), got {}",
                self.prune_val
            )));
        }
        for policy in [&self.source_augmentation, &self.target_augmentation]
            .into_iter()
            .flatten()
        {
            policy.validate()?;
        }
        Ok(())
    }

    /// Alignment weight actually applied; zero for the baseline run.
    pub fn effective_lambda(&self) -> f64 {
        if self.technique {
            self.lambda_loss
        } else {
            0.0
        }
    }

    /// Directory name identifying this run.
    pub fn run_signature(&self) -> String {
        let mut signature = format!(
            "{}_{}_{}_{}",
            self.combination, self.architecture, self.loss_function, self.lambda_loss
        );
        if !self.technique {
            signature.push_str("_Original");
        }
        if self.prune {
            signature.push_str(&format!("_{}", self.prune_val));
        }
        signature
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.num_classes, self.architecture)
            .with_feature_width(self.feature_width)
    }

    /// Resolve the domain pair against the configured roots.
    pub fn pair_layout(&self, experiment_dir: &Path) -> PairLayout {
        let mut layout = self.combination.layout(&self.roots, experiment_dir);
        if let Some(policy) = &self.source_augmentation {
            layout.source_policy = policy.clone();
        }
        if let Some(policy) = &self.target_augmentation {
            layout.target_policy = policy.clone();
        }
        layout
    }
}

impl DomainPair {
    pub const ALL: [DomainPair; 9] = [
        DomainPair::AmazonToWebcam,
        DomainPair::AmazonToDslr,
        DomainPair::WebcamToAmazon,
        DomainPair::WebcamToDslr,
        DomainPair::DslrToAmazon,
        DomainPair::DslrToWebcam,
        DomainPair::MnistToMnistM,
        DomainPair::MnistMToMnist,
        DomainPair::SynSignsToGtsrb,
    ];

    /// (family root, source subdirectory, target subdirectory).
    fn directories<'a>(&self, roots: &'a DataRoots) -> (&'a str, &'static str, &'static str) {
        match self {
            DomainPair::AmazonToWebcam => (&roots.office, "amazon", "webcam"),
            DomainPair::AmazonToDslr => (&roots.office, "amazon", "dslr"),
            DomainPair::WebcamToAmazon => (&roots.office, "webcam", "amazon"),
            DomainPair::WebcamToDslr => (&roots.office, "webcam", "dslr"),
            DomainPair::DslrToAmazon => (&roots.office, "dslr", "amazon"),
            DomainPair::DslrToWebcam => (&roots.office, "dslr", "webcam"),
            DomainPair::MnistToMnistM => (&roots.digits, "mnist", "mnist_m"),
            DomainPair::MnistMToMnist => (&roots.digits, "mnist_m", "mnist"),
            DomainPair::SynSignsToGtsrb => (&roots.synthetic, "synsigns", "gtsrb"),
        }
    }

    /// Whether the source list is the one extended by whole-list repetition.
    ///
    /// Set for the combinations whose source corpus is the smaller one.
    pub fn repeat_source(&self) -> bool {
        matches!(
            self,
            DomainPair::WebcamToAmazon | DomainPair::DslrToAmazon | DomainPair::DslrToWebcam
        )
    }

    pub fn layout(&self, roots: &DataRoots, experiment_dir: &Path) -> PairLayout {
        let (family, source, target) = self.directories(roots);
        let family = resolve_root(experiment_dir, family);
        let (source_greyscale, target_greyscale) = match self {
            DomainPair::MnistToMnistM => (true, false),
            DomainPair::MnistMToMnist => (false, true),
            _ => (false, false),
        };
        let (source_policy, target_policy) = match self {
            DomainPair::MnistToMnistM | DomainPair::MnistMToMnist => {
                (AugmentationPolicy::photometric(), AugmentationPolicy::plain())
            }
            _ => (AugmentationPolicy::geometric(), AugmentationPolicy::plain()),
        };
        PairLayout {
            source_root: family.join(source),
            target_root: family.join(target),
            repeat_source: self.repeat_source(),
            source_greyscale,
            target_greyscale,
            source_policy,
            target_policy,
        }
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for LossFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossFunction::Coral => f.write_str("CORAL"),
        }
    }
}

/// Resolve a root relative to the experiment directory if needed.
pub fn resolve_root(experiment_dir: &Path, root: &str) -> PathBuf {
    let candidate = PathBuf::from(root);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}
