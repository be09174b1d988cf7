//! Export batch results to CSV.
//!
//! The exports are meant to be easy to consume in spreadsheets or downstream scripts.
//! Failed locations stay in every file so row counts always match the input.

use std::fmt::Display;
use std::fs::File;
use std::path::Path;

use csv::{Terminator, Writer, WriterBuilder};

use crate::error::DeconvError;
use crate::fit::{DoubletResults, FullResults, outcome_label};

/// Full-mode weights: `location,status,<cell types...>`.
pub fn write_weights_csv(path: &Path, results: &FullResults) -> Result<(), DeconvError> {
    let mut out = create(path)?;
    let header = ["location", "status"]
        .into_iter()
        .chain(results.cell_types.iter().map(String::as_str));
    out.write_record(header).map_err(|e| write_error(path, e))?;

    let weights = results.weight_matrix();
    for (loc, name) in results.locations.iter().enumerate() {
        let mut row = vec![name.clone(), outcome_label(&results.outcomes[loc]).to_string()];
        row.extend(weights.row(loc).iter().map(|w| format!("{w:.8}")));
        out.write_record(&row).map_err(|e| write_error(path, e))?;
    }
    out.flush().map_err(|e| write_error(path, e))
}

/// Doublet-mode records, one row per location.
pub fn write_doublet_csv(path: &Path, results: &DoubletResults) -> Result<(), DeconvError> {
    let mut out = create(path)?;
    out.write_record([
        "location",
        "spot_class",
        "first_type",
        "second_type",
        "first_weight",
        "second_weight",
        "singlet_score",
        "doublet_score",
    ])
    .map_err(|e| write_error(path, e))?;

    let type_name = |t: Option<usize>| t.map(|t| results.cell_types[t].clone()).unwrap_or_default();
    for (loc, name) in results.locations.iter().enumerate() {
        let r = results.record(loc);
        let first_weight = if r.first_type.is_some() {
            format!("{:.8}", r.first_weight)
        } else {
            String::new()
        };
        out.write_record([
            name.clone(),
            r.spot_class.label().to_string(),
            type_name(r.first_type),
            type_name(r.second_type),
            first_weight,
            r.second_weight.map(|w| format!("{w:.8}")).unwrap_or_default(),
            fmt_score(r.singlet_score),
            r.doublet_score.map(fmt_score).unwrap_or_default(),
        ])
        .map_err(|e| write_error(path, e))?;
    }
    out.flush().map_err(|e| write_error(path, e))
}

/// Doublet-mode weights in coordinate form: `location,cell_type,weight`.
pub fn write_sparse_weights_csv(path: &Path, results: &DoubletResults) -> Result<(), DeconvError> {
    let mut out = create(path)?;
    out.write_record(["location", "cell_type", "weight"])
        .map_err(|e| write_error(path, e))?;
    for entry in results.sparse_weights() {
        out.write_record([
            results.locations[entry.location].as_str(),
            results.cell_types[entry.cell_type].as_str(),
            format!("{:.8}", entry.weight).as_str(),
        ])
        .map_err(|e| write_error(path, e))?;
    }
    out.flush().map_err(|e| write_error(path, e))
}

fn fmt_score(score: f64) -> String {
    if score.is_finite() {
        format!("{score:.4}")
    } else {
        String::new()
    }
}

fn create(path: &Path) -> Result<Writer<File>, DeconvError> {
    WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)
        .map_err(|e| DeconvError::Io {
            path: path.display().to_string(),
            message: format!("failed to create export: {e}"),
        })
}

fn write_error(path: &Path, e: impl Display) -> DeconvError {
    DeconvError::Io {
        path: path.display().to_string(),
        message: format!("failed to write export: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nalgebra::DVector;

    use crate::domain::{DoubletRecord, FitStatus, SpotClass, WeightFit};
    use crate::error::LocationFailure;
    use crate::fit::Execution;

    fn doublet_results() -> DoubletResults {
        DoubletResults {
            locations: vec!["s1".into(), "s2".into(), "s3".into()],
            cell_types: vec!["B".into(), "T, naive".into()],
            outcomes: vec![
                Ok(DoubletRecord {
                    spot_class: SpotClass::DoubletCertain,
                    first_type: Some(1),
                    second_type: Some(0),
                    first_weight: 0.75,
                    second_weight: Some(0.25),
                    singlet_score: -120.5,
                    doublet_score: Some(-60.25),
                }),
                Ok(DoubletRecord {
                    spot_class: SpotClass::Singlet,
                    first_type: Some(0),
                    second_type: None,
                    first_weight: 1.0,
                    second_weight: None,
                    singlet_score: -40.0,
                    doublet_score: None,
                }),
                Err(LocationFailure::EmptyLocation { total: 0.0 }),
            ],
            execution: Execution::Sequential,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn doublet_csv_has_one_row_per_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doublets.csv");
        write_doublet_csv(&path, &doublet_results()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[1],
            "s1,doublet_certain,\"T, naive\",B,0.75000000,0.25000000,-120.5000,-60.2500"
        );
        assert_eq!(lines[2], "s2,singlet,B,,1.00000000,,-40.0000,");
        assert_eq!(lines[3], "s3,reject,,,,,,");
    }

    #[test]
    fn awkward_names_are_quoted_and_read_back() {
        let mut results = doublet_results();
        results.locations[1] = "spot \"7\"\nedge".into();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doublets.csv");
        write_doublet_csv(&path, &results).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][2], "T, naive");
        assert_eq!(&rows[1][0], "spot \"7\"\nedge");
        assert_eq!(&rows[1][1], "singlet");
    }

    #[test]
    fn sparse_csv_lists_nonzero_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.csv");
        write_sparse_weights_csv(&path, &doublet_results()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "location,cell_type,weight\n\
             s1,\"T, naive\",0.75000000\n\
             s1,B,0.25000000\n\
             s2,B,1.00000000\n"
        );
    }

    #[test]
    fn weights_csv_labels_each_location() {
        let results = FullResults {
            locations: vec!["s1".into(), "s2".into()],
            cell_types: vec!["A".into(), "B".into()],
            outcomes: vec![
                Ok(WeightFit {
                    weights: DVector::from_row_slice(&[0.25, 0.75]),
                    iterations: 4,
                    status: FitStatus::Converged,
                }),
                Err(LocationFailure::EmptyLocation { total: 0.0 }),
            ],
            execution: Execution::Parallel { workers: 2 },
            elapsed: Duration::ZERO,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.csv");
        write_weights_csv(&path, &results).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "location,status,A,B\ns1,converged,0.25000000,0.75000000\ns2,empty,0.00000000,0.00000000\n"
        );
    }
}
