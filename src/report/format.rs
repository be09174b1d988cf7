//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use nalgebra::DMatrix;

use crate::fit::{DoubletResults, FullResults};

/// Full-mode summary: execution, status counts and mean weight per cell type.
pub fn format_full_summary(results: &FullResults, sigma: f64) -> String {
    let mut out = String::new();
    let s = results.status_counts();

    out.push_str("=== deconv - full mode ===\n");
    out.push_str(&format!(
        "Locations: {} | cell types: {} | sigma={sigma:.2}\n",
        results.locations.len(),
        results.cell_types.len()
    ));
    out.push_str(&format!(
        "Execution: {} in {:.2?}\n",
        results.execution, results.elapsed
    ));
    out.push_str(&format!(
        "Status: converged={} iteration_cap={} fallback={} empty={}\n",
        s.converged, s.iteration_cap, s.fallback, s.empty
    ));

    let solved = results.outcomes.iter().filter(|o| o.is_ok()).count();
    out.push('\n');
    out.push_str(&format_mean_weights(
        &results.weight_matrix(),
        &results.cell_types,
        solved,
    ));
    out
}

/// Doublet-mode summary: spot-class histogram and mean weight per cell type.
pub fn format_doublet_summary(results: &DoubletResults, sigma: f64) -> String {
    let mut out = String::new();
    let n = results.locations.len();

    out.push_str("=== deconv - doublet mode ===\n");
    out.push_str(&format!(
        "Locations: {n} | cell types: {} | sigma={sigma:.2}\n",
        results.cell_types.len()
    ));
    out.push_str(&format!(
        "Execution: {} in {:.2?}\n",
        results.execution, results.elapsed
    ));

    out.push_str("\nSpot classes:\n");
    for (class, count) in results.class_counts() {
        let share = if n > 0 { 100.0 * count as f64 / n as f64 } else { 0.0 };
        out.push_str(&format!(
            "  {:<18} {:>6} ({share:>5.1}%)\n",
            class.label(),
            count
        ));
    }
    let failures = results.failures();
    if failures > 0 {
        out.push_str(&format!("  ({failures} failed locations counted as reject)\n"));
    }

    let solved = n - failures;
    out.push('\n');
    out.push_str(&format_mean_weights(
        &results.weight_matrix(),
        &results.cell_types,
        solved,
    ));
    out
}

/// σ search table; the chosen row is starred.
pub fn format_sigma_scores(scores: &[(f64, f64)], chosen: f64) -> String {
    let mut out = String::from("Sigma search:\n");
    for &(sigma, score) in scores {
        let mark = if sigma == chosen { "*" } else { " " };
        out.push_str(&format!("{mark} sigma={sigma:<5.2} log-lik={score:.3}\n"));
    }
    out
}

fn format_mean_weights(weights: &DMatrix<f64>, cell_types: &[String], solved: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<24} {:>12}\n", "cell_type", "mean_weight"));
    out.push_str(&format!("{:-<24} {:-<12}\n", "", ""));
    for (t, name) in cell_types.iter().enumerate() {
        let mean = if solved > 0 {
            weights.column(t).sum() / solved as f64
        } else {
            0.0
        };
        out.push_str(&format!("{:<24} {:>12.4}\n", truncate(name, 24), mean));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nalgebra::DVector;

    use crate::domain::{DoubletRecord, FitStatus, SpotClass, WeightFit};
    use crate::error::LocationFailure;
    use crate::fit::Execution;

    #[test]
    fn full_summary_averages_over_solved_locations() {
        let results = FullResults {
            locations: vec!["a".into(), "b".into(), "c".into()],
            cell_types: vec!["Astrocyte".into(), "Oligodendrocyte precursor cell".into()],
            outcomes: vec![
                Ok(WeightFit {
                    weights: DVector::from_row_slice(&[1.0, 0.0]),
                    iterations: 3,
                    status: FitStatus::Converged,
                }),
                Ok(WeightFit {
                    weights: DVector::from_row_slice(&[0.5, 0.5]),
                    iterations: 50,
                    status: FitStatus::IterationCap,
                }),
                Err(LocationFailure::EmptyLocation { total: 0.0 }),
            ],
            execution: Execution::Sequential,
            elapsed: Duration::from_millis(12),
        };
        let text = format_full_summary(&results, 0.3);
        assert!(text.contains("converged=1 iteration_cap=1 fallback=0 empty=1"));
        assert!(text.contains("Astrocyte                      0.7500"));
        assert!(text.contains("Oligodendrocyte precurs."));
    }

    #[test]
    fn doublet_summary_lists_every_class() {
        let results = DoubletResults {
            locations: vec!["a".into(), "b".into()],
            cell_types: vec!["X".into(), "Y".into()],
            outcomes: vec![
                Ok(DoubletRecord {
                    spot_class: SpotClass::Singlet,
                    first_type: Some(1),
                    second_type: None,
                    first_weight: 1.0,
                    second_weight: None,
                    singlet_score: -10.0,
                    doublet_score: None,
                }),
                Err(LocationFailure::EmptyLocation { total: 0.0 }),
            ],
            execution: Execution::Parallel { workers: 4 },
            elapsed: Duration::from_millis(5),
        };
        let text = format_doublet_summary(&results, 0.5);
        for class in SpotClass::ALL {
            assert!(text.contains(class.label()));
        }
        assert!(text.contains("1 failed locations"));
        assert!(text.contains("parallel (4 workers)"));
    }

    #[test]
    fn sigma_table_marks_choice() {
        let text = format_sigma_scores(&[(0.1, -50.0), (0.2, -40.0)], 0.2);
        assert!(text.contains("* sigma=0.20"));
        assert!(text.contains("  sigma=0.10"));
    }
}
