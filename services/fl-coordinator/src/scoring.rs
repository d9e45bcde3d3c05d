//! Binary classification scores reported by every client.

use fedround_core::Metrics;

#[derive(Debug, Default, Clone, Copy)]
struct Confusion { tp: f64, fp: f64, tn: f64, fn_: f64 }

impl Confusion {
    fn from(labels: &[f32], predicted: &[bool]) -> Self {
        let mut c = Confusion::default();
        for (&y, &p) in labels.iter().zip(predicted) {
            match (y >= 0.5, p) {
                (true, true) => c.tp += 1.0,
                (false, true) => c.fp += 1.0,
                (false, false) => c.tn += 1.0,
                (true, false) => c.fn_ += 1.0,
            }
        }
        c
    }
}

fn ratio(num: f64, den: f64) -> f64 { if den > 0.0 { num / den } else { 0.0 } }

fn f1(precision: f64, recall: f64) -> f64 { ratio(2.0 * precision * recall, precision + recall) }

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
/// A single-class label set yields 0.5.
pub fn roc_auc(labels: &[f32], scores: &[f64]) -> f64 {
    let positives = labels.iter().filter(|&&y| y >= 0.5).count() as f64;
    let negatives = labels.len() as f64 - positives;
    if positives == 0.0 || negatives == 0.0 { return 0.5; }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] { j += 1; }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += order[i..=j].iter().filter(|&&k| labels[k] >= 0.5).count() as f64 * avg_rank;
        i = j + 1;
    }
    (rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives)
}

/// accuracy, positive-class precision/recall, macro and support-weighted F1, ROC AUC.
pub fn classification_metrics(labels: &[f32], probabilities: &[f64]) -> Metrics {
    let predicted: Vec<bool> = probabilities.iter().map(|&p| p >= 0.5).collect();
    let c = Confusion::from(labels, &predicted);
    let total = c.tp + c.fp + c.tn + c.fn_;

    let precision_pos = ratio(c.tp, c.tp + c.fp);
    let recall_pos = ratio(c.tp, c.tp + c.fn_);
    let precision_neg = ratio(c.tn, c.tn + c.fn_);
    let recall_neg = ratio(c.tn, c.tn + c.fp);
    let f1_pos = f1(precision_pos, recall_pos);
    let f1_neg = f1(precision_neg, recall_neg);
    let support_pos = c.tp + c.fn_;
    let support_neg = c.tn + c.fp;

    let mut m = Metrics::new();
    m.insert("accuracy".into(), ratio(c.tp + c.tn, total));
    m.insert("precision".into(), precision_pos);
    m.insert("recall".into(), recall_pos);
    m.insert("f1_macro".into(), (f1_pos + f1_neg) / 2.0);
    m.insert("f1_weighted".into(), ratio(f1_pos * support_pos + f1_neg * support_neg, total));
    m.insert("roc_auc".into(), roc_auc(labels, probabilities));
    m
}
