use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

/// Loss and accuracy over a whole split. Accuracy is a fraction in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn train_loss(&self) -> Vec<f32> {
        self.epochs.iter().map(|m| m.train_loss).collect()
    }

    pub fn val_loss(&self) -> Vec<f32> {
        self.epochs.iter().map(|m| m.val_loss).collect()
    }
}

impl FromIterator<EpochMetrics> for TrainingHistory {
    fn from_iter<I: IntoIterator<Item = EpochMetrics>>(iter: I) -> Self {
        Self {
            epochs: iter.into_iter().collect(),
        }
    }
}
