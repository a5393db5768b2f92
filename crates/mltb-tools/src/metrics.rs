//! F1 score helpers working on ROC curve points.

use serde::{Deserialize, Serialize};

/// One point of a ROC curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
    pub threshold: f64,
}

/// Count positive and negative labels.
pub fn pos_neg<T: PartialEq>(labels: &[T], pos_label: &T) -> (usize, usize) {
    let pos = labels.iter().filter(|l| *l == pos_label).count();
    (pos, labels.len() - pos)
}

/// F1 score from a false positive rate, true positive rate and label counts.
pub fn f1_from_roc(fpr: f64, tpr: f64, pos: usize, neg: usize) -> f64 {
    let fp = fpr * neg as f64;
    let fn_ = (1.0 - tpr) * pos as f64;
    let tp = pos as f64 - fn_;
    tp / (tp + (fn_ + fp) / 2.0)
}

/// Best F1 score along a ROC curve together with its threshold.
///
/// Returns `None` when no point yields a finite score.
pub fn best_f1_from_roc(points: &[RocPoint], pos: usize, neg: usize) -> Option<(f64, f64)> {
    let mut best: Option<(f64, f64)> = None;
    for point in points {
        let f1 = f1_from_roc(point.fpr, point.tpr, pos, neg);
        if !f1.is_finite() {
            continue;
        }
        match best {
            Some((best_f1, _)) if f1 <= best_f1 => {}
            _ => best = Some((f1, point.threshold)),
        }
    }
    best
}
