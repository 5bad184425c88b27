use crate::model::branch::flatten_features;
use burn::prelude::*;
use tracing::warn;

/// Correlation alignment between two `[batch, D]` feature batches.
///
/// Squared Frobenius distance between the per-stream covariances, scaled by
/// `1 / (4 D²)`. Both inputs must share the same width. Batches with fewer
/// than two rows have no covariance; they contribute zero.
pub fn coral_loss<B: Backend>(source: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let [source_rows, width] = source.dims();
    let [target_rows, _] = target.dims();
    if source_rows <= 1 || target_rows <= 1 {
        warn!(
            source_rows,
            target_rows, "degenerate batch reached the alignment loss, term zeroed"
        );
        return Tensor::zeros([1], &source.device());
    }

    let difference = covariance(source).sub(covariance(target));
    difference
        .square()
        .sum()
        .div_scalar(4.0 * (width * width) as f64)
}

/// Unbiased covariance across the batch dimension: `[n, D] -> [D, D]`.
fn covariance<B: Backend>(features: Tensor<B, 2>) -> Tensor<B, 2> {
    let rows = features.dims()[0];
    let centered = features.clone().sub(features.mean_dim(0));
    centered
        .clone()
        .transpose()
        .matmul(centered)
        .div_scalar((rows - 1) as f64)
}

/// CORAL scaled by the alignment weight (`lambda_loss`).
#[derive(Clone, Debug)]
pub struct CoralLoss {
    pub weight: f64,
}

impl CoralLoss {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }

    /// Align two `[batch, D, h, w]` branch maps, every spatial position a row.
    ///
    /// A batch of one sample is degenerate even when its map has many
    /// positions. Returns `(raw, weighted)`.
    pub fn forward<B: Backend>(
        &self,
        source_map: Tensor<B, 4>,
        target_map: Tensor<B, 4>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let source_batch = source_map.dims()[0];
        let target_batch = target_map.dims()[0];
        let raw = if source_batch <= 1 || target_batch <= 1 {
            warn!(
                source_batch,
                target_batch, "degenerate batch reached the alignment loss, term zeroed"
            );
            Tensor::zeros([1], &source_map.device())
        } else {
            coral_loss(flatten_features(source_map), flatten_features(target_map))
        };
        let weighted = raw.clone().mul_scalar(self.weight);
        (raw, weighted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem::<f32>()
    }

    fn random(rows: usize, width: usize) -> Tensor<TestBackend, 2> {
        Tensor::random([rows, width], Distribution::Default, &Default::default())
    }

    #[test]
    fn symmetric_in_its_arguments() {
        let a = random(8, 5);
        let b = random(8, 5).mul_scalar(3.0);
        let ab = scalar(coral_loss(a.clone(), b.clone()));
        let ba = scalar(coral_loss(b, a));
        assert!(ab > 0.0);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn identical_batches_have_zero_loss() {
        let a = random(6, 4);
        assert!(scalar(coral_loss(a.clone(), a)).abs() < 1e-7);
    }

    #[test]
    fn shifting_both_batches_keeps_the_loss() {
        let device = Default::default();
        let a = random(10, 3);
        let b = random(10, 3).mul_scalar(2.0);
        let shift = Tensor::<TestBackend, 2>::from_floats([[1.5, -4.0, 7.0]], &device);
        let before = scalar(coral_loss(a.clone(), b.clone()));
        let after = scalar(coral_loss(a + shift.clone(), b + shift));
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn single_row_batch_contributes_zero() {
        let loss = coral_loss(random(1, 4), random(1, 4));
        assert_eq!(loss.dims(), [1]);
        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn known_covariances_give_the_scaled_distance() {
        let device = Default::default();
        // Covariance [[2]] for the source and [[0]] for the target.
        let source = Tensor::<TestBackend, 2>::from_floats([[1.0], [3.0]], &device);
        let target = Tensor::<TestBackend, 2>::from_floats([[5.0], [5.0]], &device);
        let loss = scalar(coral_loss(source, target));
        assert!((loss - 1.0).abs() < 1e-6);
    }

    fn random_map(batch: usize, width: usize, side: usize) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [batch, width, side, side],
            Distribution::Default,
            &Default::default(),
        )
    }

    #[test]
    fn weight_scales_only_the_weighted_term() {
        let a = random_map(5, 3, 2);
        let b = random_map(5, 3, 2).mul_scalar(4.0);
        let (raw, weighted) = CoralLoss::new(0.5).forward(a, b);
        let raw = scalar(raw);
        assert!((scalar(weighted) - 0.5 * raw).abs() < 1e-6);
    }

    #[test]
    fn maps_are_compared_position_by_position() {
        let device = Default::default();
        // Per-sample means agree, so only the spatial statistics differ.
        let source = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.0, 2.0]]], [[[2.0, 0.0]]]],
            &device,
        );
        let target = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 1.0]]], [[[1.0, 1.0]]]],
            &device,
        );
        let (raw, _) = CoralLoss::new(1.0).forward(source.clone(), target.clone());
        // Source rows 0, 2, 2, 0 have variance 4/3; the target has none.
        let expected = (4.0f32 / 3.0).powi(2) / 4.0;
        assert!((scalar(raw) - expected).abs() < 1e-5);

        let pooled = coral_loss(
            source.mean_dim(3).mean_dim(2).reshape([2, 1]),
            target.mean_dim(3).mean_dim(2).reshape([2, 1]),
        );
        assert!(scalar(pooled).abs() < 1e-7);
    }

    #[test]
    fn single_sample_map_is_degenerate_despite_many_positions() {
        let (raw, weighted) = CoralLoss::new(2.0).forward(random_map(1, 3, 4), random_map(1, 3, 4));
        assert_eq!(scalar(raw), 0.0);
        assert_eq!(scalar(weighted), 0.0);
    }
}
