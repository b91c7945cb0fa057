//! Per-epoch loss record returned by flow training.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Mean training loss of each epoch.
    pub training_loss: Vec<f64>,
    /// Mean validation loss of each epoch; empty when no validation split was used.
    pub validation_loss: Vec<f64>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_epochs(&self) -> usize {
        self.training_loss.len()
    }

    /// Loss of the last completed epoch, preferring the validation loss when available.
    pub fn final_loss(&self) -> Option<f64> {
        self.validation_loss
            .last()
            .or_else(|| self.training_loss.last())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_loss_prefers_validation() {
        let mut h = History::new();
        assert_eq!(h.final_loss(), None);
        h.training_loss.push(2.0);
        assert_eq!(h.final_loss(), Some(2.0));
        h.validation_loss.push(3.0);
        assert_eq!(h.final_loss(), Some(3.0));
        assert_eq!(h.n_epochs(), 1);
    }

    #[test]
    fn serializes_to_json() {
        let h = History {
            training_loss: vec![1.0, 0.5],
            validation_loss: vec![1.5],
        };
        let text = serde_json::to_string(&h).unwrap();
        let back: History = serde_json::from_str(&text).unwrap();
        assert_eq!(back, h);
    }
}
