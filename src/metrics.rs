use burn::train::metric::state::{FormatOptions, NumericMetricState};
use burn::train::metric::{
    Adaptor, Metric, MetricAttributes, MetricMetadata, MetricName, Numeric, NumericAttributes,
    NumericEntry, SerializedEntry,
};
use burn::train::ItemLazy;
use std::sync::Arc;

/// Scalar summary of one step, the item every learner event carries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepMetrics {
    pub batch_size: usize,
    pub correct: usize,
    pub class_loss: f64,
    pub coral_loss: f64,
    pub total_loss: f64,
}

impl StepMetrics {
    pub fn accuracy(&self) -> f64 {
        if self.batch_size == 0 {
            0.0
        } else {
            self.correct as f64 / self.batch_size as f64
        }
    }
}

impl ItemLazy for StepMetrics {
    type ItemSync = StepMetrics;

    fn sync(self) -> Self::ItemSync {
        self
    }
}

impl Adaptor<StepMetrics> for StepMetrics {
    fn adapt(&self) -> StepMetrics {
        self.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdaptationMetricKind {
    ClassLoss,
    CoralLoss,
    TotalLoss,
    Accuracy,
}

impl AdaptationMetricKind {
    fn value(&self, metrics: &StepMetrics) -> f64 {
        match self {
            AdaptationMetricKind::ClassLoss => metrics.class_loss,
            AdaptationMetricKind::CoralLoss => metrics.coral_loss,
            AdaptationMetricKind::TotalLoss => metrics.total_loss,
            AdaptationMetricKind::Accuracy => metrics.accuracy(),
        }
    }
}

/// Batch-weighted numeric metric over [`StepMetrics`].
///
/// The learner logs the `train` split from paired batches and the `valid`
/// split from the duplicated-slot target stream.
#[derive(Clone)]
pub struct AdaptationMetric {
    kind: AdaptationMetricKind,
    name: MetricName,
    state: NumericMetricState,
}

impl AdaptationMetric {
    pub fn new(kind: AdaptationMetricKind, name: &str) -> Self {
        Self {
            kind,
            name: Arc::new(name.to_string()),
            state: NumericMetricState::default(),
        }
    }

    /// Metrics logged for the paired training split.
    pub fn train_split() -> Vec<Self> {
        vec![
            Self::new(AdaptationMetricKind::ClassLoss, "class_loss"),
            Self::new(AdaptationMetricKind::CoralLoss, "coral_loss"),
            Self::new(AdaptationMetricKind::TotalLoss, "total_loss"),
            Self::new(AdaptationMetricKind::Accuracy, "accuracy"),
        ]
    }

    /// Metrics logged for the target stream. Both slots hold the same image,
    /// so only the classification terms are meaningful.
    pub fn target_split() -> Vec<Self> {
        vec![
            Self::new(AdaptationMetricKind::ClassLoss, "target_loss"),
            Self::new(AdaptationMetricKind::Accuracy, "target_accuracy"),
        ]
    }

    pub fn kind(&self) -> AdaptationMetricKind {
        self.kind
    }
}

impl Metric for AdaptationMetric {
    type Input = StepMetrics;

    fn name(&self) -> MetricName {
        self.name.clone()
    }

    fn attributes(&self) -> MetricAttributes {
        NumericAttributes {
            unit: None,
            higher_is_better: self.kind == AdaptationMetricKind::Accuracy,
        }
        .into()
    }

    fn update(&mut self, metrics: &Self::Input, _metadata: &MetricMetadata) -> SerializedEntry {
        self.state.update(
            self.kind.value(metrics),
            metrics.batch_size,
            FormatOptions::new(self.name()).precision(5),
        )
    }

    fn clear(&mut self) {
        self.state.reset();
    }
}

impl Numeric for AdaptationMetric {
    fn value(&self) -> NumericEntry {
        self.state.current_value()
    }

    fn running_value(&self) -> NumericEntry {
        self.state.running_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(batch_size: usize, correct: usize, class_loss: f64) -> StepMetrics {
        StepMetrics {
            batch_size,
            correct,
            class_loss,
            coral_loss: 0.5,
            total_loss: class_loss + 0.5,
        }
    }

    #[test]
    fn accuracy_of_an_empty_step_is_zero() {
        assert_eq!(StepMetrics::default().accuracy(), 0.0);
        assert_eq!(step(4, 3, 1.0).accuracy(), 0.75);
    }

    #[test]
    fn kinds_read_their_own_field() {
        let metrics = step(4, 1, 2.0);
        assert_eq!(AdaptationMetricKind::ClassLoss.value(&metrics), 2.0);
        assert_eq!(AdaptationMetricKind::CoralLoss.value(&metrics), 0.5);
        assert_eq!(AdaptationMetricKind::TotalLoss.value(&metrics), 2.5);
        assert_eq!(AdaptationMetricKind::Accuracy.value(&metrics), 0.25);
    }

    #[test]
    fn splits_register_distinct_names() {
        let names: Vec<String> = AdaptationMetric::train_split()
            .into_iter()
            .chain(AdaptationMetric::target_split())
            .map(|metric| metric.name().to_string())
            .collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
        assert!(names.contains(&"target_accuracy".to_string()));
    }
}
