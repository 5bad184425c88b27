use crate::error::Error;
use burn::config::Config;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, Rgb32FImage, RgbImage};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Stochastic per-stream transform settings.
///
/// Every probability is drawn independently per sample and per stage.
#[derive(Config, Debug)]
pub struct AugmentationPolicy {
    /// Maximum additive brightness shift, drawn from `[-delta, delta]`.
    pub brightness_delta: Option<f32>,
    /// Multiplicative contrast factor range `[lower, upper]`.
    pub contrast_range: Option<[f32; 2]>,
    /// Fixed saturation factor.
    pub saturation: Option<f32>,
    #[config(default = 0.0)]
    pub grayscale_probability: f64,
    #[config(default = 0.0)]
    pub noise_probability: f64,
    #[config(default = 1.0)]
    pub noise_std: f32,
    #[config(default = 0.0)]
    pub rotate_probability: f64,
    #[config(default = 0.0)]
    pub hflip_probability: f64,
    #[config(default = 0.0)]
    pub vflip_probability: f64,
}

impl AugmentationPolicy {
    /// Reject ranges the sampler cannot draw from.
    pub fn validate(&self) -> crate::error::Result<()> {
        let probabilities = [
            ("grayscale_probability", self.grayscale_probability),
            ("noise_probability", self.noise_probability),
            ("rotate_probability", self.rotate_probability),
            ("hflip_probability", self.hflip_probability),
            ("vflip_probability", self.vflip_probability),
        ];
        for (name, p) in probabilities {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Configuration(format!("{name} must lie in [0, 1], got {p}")));
            }
        }
        if matches!(self.brightness_delta, Some(delta) if !(delta >= 0.0)) {
            return Err(Error::Configuration("brightness_delta must be non-negative".into()));
        }
        if matches!(self.contrast_range, Some([lower, upper]) if !(lower <= upper)) {
            return Err(Error::Configuration("contrast_range must be [lower, upper]".into()));
        }
        if !(self.noise_std > 0.0) {
            return Err(Error::Configuration("noise_std must be positive".into()));
        }
        Ok(())
    }

    /// Resize and rescale only.
    pub fn plain() -> Self {
        Self::new()
    }

    /// Random grayscale, noise, rotation and flips.
    pub fn geometric() -> Self {
        Self::new()
            .with_grayscale_probability(0.1)
            .with_noise_probability(0.1)
            .with_rotate_probability(0.1)
            .with_hflip_probability(0.5)
            .with_vflip_probability(0.5)
    }

    /// Brightness and contrast jitter plus a fixed saturation boost.
    pub fn photometric() -> Self {
        let mut policy = Self::new();
        policy.brightness_delta = Some(0.5);
        policy.contrast_range = Some([0.1, 0.5]);
        policy.saturation = Some(3.0);
        policy
    }
}

/// Decoded image → fixed-size RGB floats in `[0, 1]`.
#[derive(Clone, Debug)]
pub struct AugmentationPipeline {
    resize: u32,
    greyscale: bool,
    policy: AugmentationPolicy,
    noise: Normal<f32>,
}

impl AugmentationPipeline {
    /// Fails with `Error::Configuration` when the policy cannot be sampled.
    pub fn new(resize: usize, greyscale: bool, policy: AugmentationPolicy) -> crate::error::Result<Self> {
        if resize == 0 {
            return Err(Error::Configuration("resize must be positive".into()));
        }
        policy.validate()?;
        let noise = Normal::new(0.0f32, policy.noise_std)
            .map_err(|err| Error::Configuration(format!("noise_std: {err}")))?;
        Ok(Self {
            resize: resize as u32,
            greyscale,
            policy,
            noise,
        })
    }

    pub fn resize(&self) -> usize {
        self.resize as usize
    }

    pub fn policy(&self) -> &AugmentationPolicy {
        &self.policy
    }

    /// Run the deterministic stages followed by the stochastic ones.
    pub fn apply(&self, image: &DynamicImage, rng: &mut impl Rng) -> Rgb32FImage {
        let rgb = if self.greyscale {
            tile_luma(image)
        } else {
            image.to_rgb8()
        };
        let rgb = if rgb.dimensions() != (self.resize, self.resize) {
            imageops::resize(&rgb, self.resize, self.resize, FilterType::Nearest)
        } else {
            rgb
        };
        let mut img = DynamicImage::ImageRgb8(rgb).into_rgb32f();

        let policy = &self.policy;
        if let Some(delta) = policy.brightness_delta {
            let shift = rng.gen_range(-delta..=delta);
            map_pixels(&mut img, |v| v + shift);
        }
        if let Some([lower, upper]) = policy.contrast_range {
            adjust_contrast(&mut img, rng.gen_range(lower..=upper));
        }
        if let Some(factor) = policy.saturation {
            adjust_saturation(&mut img, factor);
        }
        if rng.gen_bool(policy.grayscale_probability) {
            to_grayscale(&mut img);
        }
        if rng.gen_bool(policy.noise_probability) {
            for value in img.iter_mut() {
                *value += self.noise.sample(&mut *rng);
            }
        }
        if rng.gen_bool(policy.rotate_probability) {
            img = imageops::rotate90(&img);
        }
        if rng.gen_bool(policy.hflip_probability) {
            imageops::flip_horizontal_in_place(&mut img);
        }
        if rng.gen_bool(policy.vflip_probability) {
            imageops::flip_vertical_in_place(&mut img);
        }

        map_pixels(&mut img, |v| v.clamp(0.0, 1.0));
        img
    }
}

/// Collapse to a single luminance channel and tile it to three.
fn tile_luma(image: &DynamicImage) -> RgbImage {
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let v = luma.get_pixel(x, y).0[0];
        Rgb([v, v, v])
    })
}

fn map_pixels(img: &mut Rgb32FImage, f: impl Fn(f32) -> f32) {
    for value in img.iter_mut() {
        *value = f(*value);
    }
}

/// Scale each channel around its own mean.
fn adjust_contrast(img: &mut Rgb32FImage, factor: f32) {
    let count = (img.width() * img.height()).max(1) as f32;
    let mut means = [0.0f32; 3];
    for pixel in img.pixels() {
        for (mean, value) in means.iter_mut().zip(pixel.0) {
            *mean += value;
        }
    }
    for mean in means.iter_mut() {
        *mean /= count;
    }
    for pixel in img.pixels_mut() {
        for (value, mean) in pixel.0.iter_mut().zip(means) {
            *value = (*value - mean) * factor + mean;
        }
    }
}

/// Blend each pixel away from (or toward) its own luminance.
fn adjust_saturation(img: &mut Rgb32FImage, factor: f32) {
    for pixel in img.pixels_mut() {
        let gray = luminance(pixel.0);
        for value in pixel.0.iter_mut() {
            *value = gray + (*value - gray) * factor;
        }
    }
}

fn to_grayscale(img: &mut Rgb32FImage) {
    for pixel in img.pixels_mut() {
        let gray = luminance(pixel.0);
        pixel.0 = [gray; 3];
    }
}

fn luminance([r, g, b]: [f32; 3]) -> f32 {
    0.2989 * r + 0.587 * g + 0.114 * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use rand::{rngs::StdRng, SeedableRng};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 9 + y * 5) % 256) as u8])
        }))
    }

    #[test]
    fn greyscale_input_becomes_square_rgb_in_unit_range() {
        let pipeline = AugmentationPipeline::new(64, true, AugmentationPolicy::plain()).unwrap();
        let out = pipeline.apply(&gradient(28, 28), &mut StdRng::seed_from_u64(0));
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(out.as_raw().len(), 64 * 64 * 3);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(out.pixels().all(|p| p.0[0] == p.0[1] && p.0[1] == p.0[2]));
    }

    #[test]
    fn every_policy_stays_in_unit_range() {
        let policy = AugmentationPolicy::photometric()
            .with_grayscale_probability(0.5)
            .with_noise_probability(1.0)
            .with_rotate_probability(0.5)
            .with_hflip_probability(0.5)
            .with_vflip_probability(0.5);
        let pipeline = AugmentationPipeline::new(16, false, policy).unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(20, 12, |x, y| {
            Rgb([(x * 12) as u8, (y * 20) as u8, 128])
        }));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let out = pipeline.apply(&image, &mut rng);
            assert_eq!(out.dimensions(), (16, 16));
            assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn same_seed_reproduces_the_same_augmentation() {
        let pipeline =
            AugmentationPipeline::new(8, true, AugmentationPolicy::geometric()).unwrap();
        let image = gradient(8, 8);
        let a = pipeline.apply(&image, &mut StdRng::seed_from_u64(99));
        let b = pipeline.apply(&image, &mut StdRng::seed_from_u64(99));
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn certain_flip_mirrors_the_image() {
        let pipeline = AugmentationPipeline::new(
            4,
            true,
            AugmentationPolicy::new().with_hflip_probability(1.0),
        )
        .unwrap();
        let image = gradient(4, 4);
        let plain = AugmentationPipeline::new(4, true, AugmentationPolicy::plain())
            .unwrap()
            .apply(&image, &mut StdRng::seed_from_u64(0));
        let flipped = pipeline.apply(&image, &mut StdRng::seed_from_u64(0));
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(flipped.get_pixel(x, y), plain.get_pixel(3 - x, y));
            }
        }
    }

    #[test]
    fn invalid_probability_is_rejected() {
        let policy = AugmentationPolicy::new().with_hflip_probability(1.5);
        assert!(matches!(policy.validate(), Err(Error::Configuration(_))));
        assert!(AugmentationPolicy::geometric().validate().is_ok());
        assert!(AugmentationPolicy::photometric().validate().is_ok());
    }

    #[test]
    fn pipeline_refuses_policies_it_cannot_sample() {
        let zero_noise = AugmentationPolicy::geometric().with_noise_std(0.0);
        assert!(matches!(
            AugmentationPipeline::new(8, false, zero_noise),
            Err(Error::Configuration(_))
        ));
        let bad_flip = AugmentationPolicy::new().with_vflip_probability(-0.1);
        assert!(matches!(
            AugmentationPipeline::new(8, false, bad_flip),
            Err(Error::Configuration(_))
        ));
        assert!(AugmentationPipeline::new(0, false, AugmentationPolicy::plain()).is_err());
    }

    #[test]
    fn certain_noise_changes_pixels() {
        let policy = AugmentationPolicy::new()
            .with_noise_probability(1.0)
            .with_noise_std(0.05);
        let noisy = AugmentationPipeline::new(8, false, policy).unwrap();
        let plain = AugmentationPipeline::new(8, false, AugmentationPolicy::plain()).unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([128, 128, 128])));
        let a = noisy.apply(&image, &mut StdRng::seed_from_u64(5));
        let b = plain.apply(&image, &mut StdRng::seed_from_u64(5));
        assert_ne!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn saturation_leaves_gray_pixels_alone() {
        let mut img = Rgb32FImage::from_pixel(2, 2, Rgb([0.4, 0.4, 0.4]));
        adjust_saturation(&mut img, 3.0);
        assert!(img.iter().all(|v| (v - 0.4).abs() < 1e-6));
    }
}
