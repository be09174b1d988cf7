//! CSV ingest and validation.
//!
//! Inputs are plain labelled matrices:
//!
//! - reference: `gene,<cell type...>`
//! - counts: `gene,<location...>`
//! - totals (optional): `location,total`
//! - classes (optional): `cell_type,class`
//! - gene list (optional): one gene per line
//!
//! Any malformed cell is a hard error with its line number. No fitting logic here.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;
use nalgebra::DMatrix;

use crate::domain::{ClassMapping, DeconvConfig, GeneSet, ReferenceProfile, SpatialDataset};
use crate::error::DeconvError;

/// A matrix with row and column labels, as read from CSV.
#[derive(Debug, Clone)]
pub struct LabeledMatrix {
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
    pub values: DMatrix<f64>,
}

/// Read a CSV whose first column holds row labels and whose header holds column labels.
pub fn read_labeled_matrix(path: &Path) -> Result<LabeledMatrix, DeconvError> {
    let mut reader = open_csv(path)?;
    let headers = read_headers(&mut reader, path)?;
    if headers.len() < 2 {
        return Err(DeconvError::Parse {
            path: path.display().to_string(),
            line: 1,
            message: "expected a label column and at least one value column".to_string(),
        });
    }
    let col_names: Vec<String> = headers
        .iter()
        .skip(1)
        .map(|h| normalize_header_name(h).to_string())
        .collect();

    let mut row_names = Vec::new();
    let mut data = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        // records() starts after the header; lines are 1-based.
        let line = idx + 2;
        let record = result.map_err(|e| parse_error(path, line, format!("CSV parse error: {e}")))?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        if record.len() != headers.len() {
            return Err(parse_error(
                path,
                line,
                format!("expected {} fields, found {}", headers.len(), record.len()),
            ));
        }
        row_names.push(record[0].to_string());
        for (col, field) in record.iter().skip(1).enumerate() {
            data.push(parse_value(field, path, line, &col_names[col])?);
        }
    }

    let values = DMatrix::from_row_slice(row_names.len(), col_names.len(), &data);
    Ok(LabeledMatrix {
        row_names,
        col_names,
        values,
    })
}

pub fn load_reference(path: &Path) -> Result<ReferenceProfile, DeconvError> {
    let m = read_labeled_matrix(path)?;
    log::info!(
        "reference '{}': {} genes x {} cell types",
        path.display(),
        m.row_names.len(),
        m.col_names.len()
    );
    ReferenceProfile::new(m.row_names, m.col_names, m.values)
}

/// Load a count matrix, with totals from `totals_path` or else column sums.
pub fn load_counts(path: &Path, totals_path: Option<&Path>) -> Result<SpatialDataset, DeconvError> {
    let m = read_labeled_matrix(path)?;
    log::info!(
        "counts '{}': {} genes x {} locations",
        path.display(),
        m.row_names.len(),
        m.col_names.len()
    );
    match totals_path {
        None => SpatialDataset::with_column_totals(m.row_names, m.col_names, m.values),
        Some(totals_path) => {
            let totals = read_two_columns(totals_path, "location", "total")?;
            let lookup: HashMap<&str, (usize, &str)> = totals
                .iter()
                .map(|(line, loc, total)| (loc.as_str(), (*line, total.as_str())))
                .collect();
            let mut out = Vec::with_capacity(m.col_names.len());
            for loc in &m.col_names {
                let Some(&(line, raw)) = lookup.get(loc.as_str()) else {
                    return Err(DeconvError::InvalidData(format!(
                        "location '{loc}' has no entry in '{}'",
                        totals_path.display()
                    )));
                };
                out.push(parse_value(raw, totals_path, line, "total")?);
            }
            SpatialDataset::new(m.row_names, m.col_names, m.values, out)
        }
    }
}

/// One gene per line. Blank lines, `#` comments and a leading `gene` header are skipped.
pub fn load_gene_list(path: &Path) -> Result<GeneSet, DeconvError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let genes: Vec<String> = text
        .lines()
        .map(|l| l.trim().trim_start_matches('\u{feff}'))
        .enumerate()
        .filter(|(i, l)| !l.is_empty() && !l.starts_with('#') && !(*i == 0 && l.eq_ignore_ascii_case("gene")))
        .map(|(_, l)| l.to_string())
        .collect();
    GeneSet::new(genes)
}

pub fn load_class_mapping(path: &Path, cell_types: &[String]) -> Result<ClassMapping, DeconvError> {
    let pairs: Vec<(String, String)> = read_two_columns(path, "cell_type", "class")?
        .into_iter()
        .map(|(_, t, c)| (t, c))
        .collect();
    ClassMapping::from_pairs(cell_types, &pairs)
}

/// Read a TOML run configuration. Missing keys take their defaults.
pub fn load_config(path: &Path) -> Result<DeconvConfig, DeconvError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    toml::from_str(&text).map_err(|e| DeconvError::InvalidConfig(format!("{}: {e}", path.display())))
}

fn open_csv(path: &Path) -> Result<csv::Reader<File>, DeconvError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file))
}

fn read_headers(reader: &mut csv::Reader<File>, path: &Path) -> Result<StringRecord, DeconvError> {
    Ok(reader
        .headers()
        .map_err(|e| parse_error(path, 1, format!("failed to read CSV headers: {e}")))?
        .clone())
}

/// Rows of a two-column keyed CSV as `(line, key, value)`.
fn read_two_columns(
    path: &Path,
    key: &str,
    value: &str,
) -> Result<Vec<(usize, String, String)>, DeconvError> {
    let mut reader = open_csv(path)?;
    let headers = read_headers(&mut reader, path)?;
    let header_map = build_header_map(&headers);
    let column = |name: &str| {
        header_map
            .get(name)
            .copied()
            .ok_or_else(|| parse_error(path, 1, format!("missing required column: `{name}`")))
    };
    let (key_col, value_col) = (column(key)?, column(value)?);

    let mut out = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        let record = result.map_err(|e| parse_error(path, line, format!("CSV parse error: {e}")))?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        match (record.get(key_col), record.get(value_col)) {
            (Some(k), Some(v)) if !k.is_empty() => out.push((line, k.to_string(), v.to_string())),
            _ => {
                return Err(parse_error(
                    path,
                    line,
                    format!("expected `{key}` and `{value}` fields"),
                ));
            }
        }
    }
    Ok(out)
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name).to_ascii_lowercase(), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> &str {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM.
    name.trim().trim_start_matches('\u{feff}')
}

fn parse_value(field: &str, path: &Path, line: usize, column: &str) -> Result<f64, DeconvError> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|_| parse_error(path, line, format!("invalid number '{field}' in column `{column}`")))
}

fn parse_error(path: &Path, line: usize, message: String) -> DeconvError {
    DeconvError::Parse {
        path: path.display().to_string(),
        line,
        message,
    }
}

fn io_error(path: &Path, e: std::io::Error) -> DeconvError {
    DeconvError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Constraint, SolveMode};
    use std::path::PathBuf;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn reference_is_read_row_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "ref.csv", "\u{feff}gene,B cell,T cell\nCd19,0.4,0.01\nCd3e,0.02,0.5\n");
        let reference = load_reference(&path).unwrap();
        assert_eq!(reference.cell_types(), ["B cell", "T cell"]);
        assert_eq!(reference.genes(), ["Cd19", "Cd3e"]);
        assert_eq!(reference.values()[(1, 1)], 0.5);
    }

    #[test]
    fn counts_default_to_column_sums() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "counts.csv", "gene,s1,s2\na,3,0\nb,4,0\n");
        let data = load_counts(&path, None).unwrap();
        assert_eq!(data.totals(), [7.0, 0.0]);
    }

    #[test]
    fn explicit_totals_are_matched_by_location() {
        let dir = tempfile::tempdir().unwrap();
        let counts = write(&dir, "counts.csv", "gene,s1,s2\na,3,1\n");
        let totals = write(&dir, "totals.csv", "location,total\ns2,120\ns1,80\n");
        let data = load_counts(&counts, Some(&totals)).unwrap();
        assert_eq!(data.totals(), [80.0, 120.0]);

        let partial = write(&dir, "partial.csv", "location,total\ns1,80\n");
        assert!(matches!(
            load_counts(&counts, Some(&partial)),
            Err(DeconvError::InvalidData(_))
        ));
    }

    #[test]
    fn bad_cell_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "counts.csv", "gene,s1\na,3\nb,x\n");
        match load_counts(&path, None) {
            Err(DeconvError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_reference(&dir.path().join("nope.csv")).unwrap_err();
        assert!(matches!(err, DeconvError::Io { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn gene_list_skips_header_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "genes.txt", "gene\n# markers\nCd19\n\nCd3e\n");
        let genes = load_gene_list(&path).unwrap();
        assert_eq!(genes.genes(), ["Cd19", "Cd3e"]);
    }

    #[test]
    fn class_mapping_requires_known_types() {
        let dir = tempfile::tempdir().unwrap();
        let types = vec!["B".to_string(), "T".to_string(), "NK".to_string()];
        let path = write(&dir, "classes.csv", "cell_type,class\nT,lymphoid\nNK,lymphoid\n");
        let classes = load_class_mapping(&path, &types).unwrap();
        assert!(classes.same_class(1, 2));
        assert!(!classes.same_class(0, 1));

        let bad = write(&dir, "bad.csv", "cell_type,class\nMacrophage,myeloid\n");
        assert!(load_class_mapping(&bad, &types).is_err());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "deconv.toml",
            "max_workers = 2\nmode = { ols = \"non_negative\" }\n\n[quadrature]\ncount_cap = 150\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.mode, SolveMode::Ols(Constraint::NonNegative));
        assert_eq!(config.quadrature.count_cap, 150);
        assert_eq!(config.quadrature.grid_points, 400);
        assert_eq!(config.doublet_margin, 25.0);
    }
}
