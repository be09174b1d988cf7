//! Synthetic spatial datasets with known composition.
//!
//! The reference has `markers_per_type` marker genes per cell type carrying most
//! of that type's mass. Locations are either pure (singlet) or a two-type mix,
//! and counts are Poisson with a log-normal rate multiplier, matching the count
//! model the quadrature table assumes.

use nalgebra::{DMatrix, DVector};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{LogNormal, Poisson};
use serde::{Deserialize, Serialize};

use crate::domain::{DoubletRecord, ReferenceProfile, SpatialDataset, SpotClass};
use crate::error::DeconvError;

/// Share of a type's expression concentrated on its own markers.
const MARKER_MASS: f64 = 0.9;

/// Reference with `n_types` types, each owning `markers_per_type` marker genes.
///
/// Columns sum to one. Marker genes of type `t` are rows
/// `t * markers_per_type .. (t + 1) * markers_per_type`.
pub fn marker_reference(
    n_types: usize,
    markers_per_type: usize,
) -> Result<ReferenceProfile, DeconvError> {
    if markers_per_type == 0 {
        return Err(DeconvError::InvalidConfig(
            "markers_per_type must be >= 1".to_string(),
        ));
    }
    let n_genes = n_types * markers_per_type;
    let background = n_genes - markers_per_type.min(n_genes);
    let (marker, other) = if background == 0 {
        (1.0 / markers_per_type as f64, 0.0)
    } else {
        (
            MARKER_MASS / markers_per_type as f64,
            (1.0 - MARKER_MASS) / background as f64,
        )
    };

    let values = DMatrix::from_fn(n_genes, n_types, |g, t| {
        if g / markers_per_type == t { marker } else { other }
    });
    let cell_types: Vec<String> = (0..n_types).map(|t| format!("type{t}")).collect();
    let genes = (0..n_genes)
        .map(|g| format!("{}_m{}", cell_types[g / markers_per_type], g % markers_per_type))
        .collect();
    ReferenceProfile::new(genes, cell_types, values)
}

/// Expected counts of a location holding `parts` (type index, weight) at total `total`.
pub fn mixture_counts(profile: &DMatrix<f64>, parts: &[(usize, f64)], total: f64) -> DVector<f64> {
    let mut lambda = DVector::zeros(profile.nrows());
    for &(t, w) in parts {
        lambda += profile.column(t) * (w * total);
    }
    lambda
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSpec {
    pub n_types: usize,
    pub markers_per_type: usize,
    pub n_locations: usize,
    /// Probability that a location mixes two types.
    pub doublet_fraction: f64,
    pub mean_total: f64,
    /// Log-scale sd of the per-gene rate multiplier.
    pub sigma: f64,
    pub seed: u64,
}

impl Default for SimulationSpec {
    fn default() -> Self {
        Self {
            n_types: 6,
            markers_per_type: 5,
            n_locations: 200,
            doublet_fraction: 0.3,
            mean_total: 500.0,
            sigma: 0.3,
            seed: 7,
        }
    }
}

/// What generated one synthetic location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub first_type: usize,
    pub second_type: Option<usize>,
    pub first_weight: f64,
}

impl GroundTruth {
    /// Whether a doublet-mode call recovers the generating composition.
    ///
    /// Singlets must be called singlet with the right type; mixtures must be
    /// called a doublet (certain or uncertain) over the same unordered pair.
    pub fn matches(&self, record: &DoubletRecord) -> bool {
        match self.second_type {
            None => {
                record.spot_class == SpotClass::Singlet
                    && record.first_type == Some(self.first_type)
            }
            Some(second) => {
                matches!(
                    record.spot_class,
                    SpotClass::DoubletCertain | SpotClass::DoubletUncertain
                ) && {
                    let called = (record.first_type, record.second_type);
                    called == (Some(self.first_type), Some(second))
                        || called == (Some(second), Some(self.first_type))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub reference: ReferenceProfile,
    pub data: SpatialDataset,
    pub truth: Vec<GroundTruth>,
}

pub fn simulate(spec: &SimulationSpec) -> Result<SyntheticData, DeconvError> {
    if spec.n_types == 0 || spec.n_locations == 0 {
        return Err(DeconvError::InvalidConfig(
            "simulation needs at least one cell type and one location".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&spec.doublet_fraction) {
        return Err(DeconvError::InvalidConfig(format!(
            "doublet_fraction must be in [0, 1] (got {})",
            spec.doublet_fraction
        )));
    }
    if !(spec.mean_total.is_finite() && spec.mean_total >= 1.0) {
        return Err(DeconvError::InvalidConfig(format!(
            "mean_total must be >= 1 (got {})",
            spec.mean_total
        )));
    }

    let reference = marker_reference(spec.n_types, spec.markers_per_type)?;
    let profile = reference.values();
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let noise = LogNormal::new(0.0, spec.sigma)
        .map_err(|e| DeconvError::InvalidConfig(format!("noise distribution error: {e}")))?;

    let n_genes = profile.nrows();
    let mut counts = DMatrix::zeros(n_genes, spec.n_locations);
    let mut truth = Vec::with_capacity(spec.n_locations);

    for loc in 0..spec.n_locations {
        let total = rng
            .gen_range(0.5 * spec.mean_total..=1.5 * spec.mean_total)
            .round();
        let first = rng.gen_range(0..spec.n_types);
        let mixed = spec.n_types > 1 && rng.gen_bool(spec.doublet_fraction);
        let location = if mixed {
            let mut second = rng.gen_range(0..spec.n_types - 1);
            if second >= first {
                second += 1;
            }
            GroundTruth {
                first_type: first,
                second_type: Some(second),
                first_weight: rng.gen_range(0.55..=0.85),
            }
        } else {
            GroundTruth {
                first_type: first,
                second_type: None,
                first_weight: 1.0,
            }
        };

        let mut parts = vec![(location.first_type, location.first_weight)];
        if let Some(second) = location.second_type {
            parts.push((second, 1.0 - location.first_weight));
        }
        let lambda = mixture_counts(profile, &parts, total);
        for g in 0..n_genes {
            let rate = lambda[g] * noise.sample(&mut rng);
            counts[(g, loc)] = if rate > 0.0 {
                Poisson::new(rate)
                    .map_err(|e| DeconvError::InvalidData(format!("count distribution error: {e}")))?
                    .sample(&mut rng)
            } else {
                0.0
            };
        }
        truth.push(location);
    }

    let locations = (0..spec.n_locations).map(|i| format!("spot_{i:04}")).collect();
    let data =
        SpatialDataset::with_column_totals(reference.genes().to_vec(), locations, counts)?;
    log::debug!(
        "simulated {} locations over {} genes (seed {})",
        spec.n_locations,
        n_genes,
        spec.seed
    );

    Ok(SyntheticData {
        reference,
        data,
        truth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn marker_reference_columns_are_distributions() {
        let reference = marker_reference(4, 3).unwrap();
        assert_eq!(reference.genes().len(), 12);
        assert_eq!(reference.genes()[4], "type1_m1");
        for t in 0..4 {
            assert_abs_diff_eq!(reference.values().column(t).sum(), 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(reference.values()[(3 * t, t)], 0.3, epsilon = 1e-12);
        }
    }

    #[test]
    fn single_type_reference_puts_all_mass_on_markers() {
        let reference = marker_reference(1, 4).unwrap();
        assert!(reference.values().iter().all(|v| (*v - 0.25).abs() < 1e-12));
    }

    #[test]
    fn simulation_is_seeded() {
        let spec = SimulationSpec {
            n_locations: 20,
            ..SimulationSpec::default()
        };
        let a = simulate(&spec).unwrap();
        let b = simulate(&spec).unwrap();
        assert_eq!(a.data.counts(), b.data.counts());
        assert_eq!(a.truth, b.truth);
        assert_eq!(a.data.n_locations(), 20);

        let other = simulate(&SimulationSpec { seed: 8, ..spec }).unwrap();
        assert_ne!(a.data.counts(), other.data.counts());
    }

    #[test]
    fn mixtures_use_two_distinct_types() {
        let spec = SimulationSpec {
            doublet_fraction: 1.0,
            n_locations: 50,
            ..SimulationSpec::default()
        };
        let sim = simulate(&spec).unwrap();
        for t in &sim.truth {
            let second = t.second_type.unwrap();
            assert_ne!(second, t.first_type);
            assert!((0.55..=0.85).contains(&t.first_weight));
        }
    }

    #[test]
    fn ground_truth_accepts_either_pair_order() {
        let truth = GroundTruth {
            first_type: 2,
            second_type: Some(0),
            first_weight: 0.6,
        };
        let record = DoubletRecord {
            spot_class: SpotClass::DoubletUncertain,
            first_type: Some(0),
            second_type: Some(2),
            first_weight: 0.45,
            second_weight: Some(0.55),
            singlet_score: -100.0,
            doublet_score: Some(-50.0),
        };
        assert!(truth.matches(&record));
        assert!(!truth.matches(&DoubletRecord::rejected(-100.0)));
    }
}
