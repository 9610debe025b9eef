//! CSV row reader keyed by covariate and response column names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use larch_rf::{
    CompetingRiskResponse, CompetingRiskResponseWithCensorTime, Covariate, CovariateValue, Row,
};
use tracing::{debug, info, instrument};

use crate::IoError;

/// Reads training or prediction rows from a CSV file.
///
/// Expected CSV format:
/// - Header row required; columns are located by name, so order and extra
///   columns do not matter
/// - One row per observation; row ids are the zero-based data-row positions
/// - Empty cells and `na` (any case) are missing covariate values
///
/// Covariates must be passed in index order: the value of `covariates[i]` is
/// stored at position `i` of every row.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | File doesn't exist or is unreadable |
/// | [`IoError::CsvParse`] | Malformed CSV record |
/// | [`IoError::MissingColumn`] | A named column is not in the header |
/// | [`IoError::InconsistentRowLength`] | Row has different column count than header |
/// | [`IoError::InvalidValue`] | Covariate cell does not parse for its type |
/// | [`IoError::InvalidResponse`] | Response cell is missing or malformed |
/// | [`IoError::EmptyDataset`] | Zero data rows after header |
pub struct RowReader {
    path: PathBuf,
}

/// Column positions resolved from the header.
struct Layout {
    covariates: Vec<usize>,
    responses: Vec<usize>,
    n_columns: usize,
}

impl RowReader {
    /// Create a new reader for the given CSV file path.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Return the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read rows with a real-valued response from `column`.
    pub fn read_regression(
        &self,
        covariates: &[Covariate],
        column: &str,
    ) -> Result<Vec<Row<f64>>, IoError> {
        self.read_with(covariates, &[column], |cells| parse_time(cells[0]).ok_or(0))
    }

    /// Read rows with a competing-risk response.
    ///
    /// `delta_column` holds the event code (0 = censored), `time_column` the
    /// observed time.
    pub fn read_competing_risk(
        &self,
        covariates: &[Covariate],
        delta_column: &str,
        time_column: &str,
    ) -> Result<Vec<Row<CompetingRiskResponse>>, IoError> {
        self.read_with(covariates, &[delta_column, time_column], |cells| {
            let delta = parse_delta(cells[0]).ok_or(0usize)?;
            let u = parse_time(cells[1]).ok_or(1usize)?;
            Ok(CompetingRiskResponse::new(delta, u))
        })
    }

    /// Read rows with a competing-risk response that also carries the
    /// individual's censoring time, as Gray's test requires.
    pub fn read_competing_risk_with_censor_time(
        &self,
        covariates: &[Covariate],
        delta_column: &str,
        time_column: &str,
        censor_time_column: &str,
    ) -> Result<Vec<Row<CompetingRiskResponseWithCensorTime>>, IoError> {
        self.read_with(
            covariates,
            &[delta_column, time_column, censor_time_column],
            |cells| {
                let delta = parse_delta(cells[0]).ok_or(0usize)?;
                let u = parse_time(cells[1]).ok_or(1usize)?;
                let c = parse_time(cells[2]).ok_or(2usize)?;
                Ok(CompetingRiskResponseWithCensorTime::new(delta, u, c))
            },
        )
    }

    /// Read covariates only, for prediction on rows without a known response.
    pub fn read_covariates(&self, covariates: &[Covariate]) -> Result<Vec<Row<()>>, IoError> {
        self.read_with(covariates, &[], |_| Ok(()))
    }

    /// Shared read loop. `parse_response` receives the response cells in the
    /// order of `response_columns` and returns the position of the cell it
    /// rejected.
    #[instrument(skip_all, fields(path = %self.path.display(), n_covariates = covariates.len()))]
    fn read_with<Y>(
        &self,
        covariates: &[Covariate],
        response_columns: &[&str],
        parse_response: impl Fn(&[&str]) -> Result<Y, usize>,
    ) -> Result<Vec<Row<Y>>, IoError> {
        let file = std::fs::File::open(&self.path).map_err(|e| IoError::FileNotFound {
            path: self.path.clone(),
            source: e,
        })?;

        // flexible(true) so a short row reports InconsistentRowLength rather than CsvParse.
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let header = rdr.headers().map_err(|e| self.csv_error(e))?.clone();
        let layout = self.layout(&header, covariates, response_columns)?;
        debug!(n_columns = layout.n_columns, "read CSV header");

        let mut rows = Vec::new();
        for (row_index, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| self.csv_error(e))?;
            if record.len() != layout.n_columns {
                return Err(IoError::InconsistentRowLength {
                    path: self.path.clone(),
                    row_index,
                    expected: layout.n_columns,
                    got: record.len(),
                });
            }

            let values = covariates
                .iter()
                .zip(&layout.covariates)
                .map(|(covariate, &col)| covariate.parse_value(&record[col]))
                .collect::<Result<Vec<CovariateValue>, _>>()
                .map_err(|source| IoError::InvalidValue {
                    path: self.path.clone(),
                    row_index,
                    source,
                })?;

            let cells: Vec<&str> = layout.responses.iter().map(|&col| record[col].trim()).collect();
            let response = parse_response(&cells).map_err(|bad| IoError::InvalidResponse {
                path: self.path.clone(),
                row_index,
                column: response_columns[bad].to_string(),
                raw: cells[bad].to_string(),
            })?;

            rows.push(Row::new(row_index, values, response));
        }

        if rows.is_empty() {
            return Err(IoError::EmptyDataset {
                path: self.path.clone(),
            });
        }

        info!(n_rows = rows.len(), "rows loaded");
        Ok(rows)
    }

    fn layout(
        &self,
        header: &csv::StringRecord,
        covariates: &[Covariate],
        response_columns: &[&str],
    ) -> Result<Layout, IoError> {
        let positions: HashMap<&str, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim(), i))
            .collect();
        let locate = |column: &str| {
            positions
                .get(column)
                .copied()
                .ok_or_else(|| IoError::MissingColumn {
                    path: self.path.clone(),
                    column: column.to_string(),
                })
        };
        Ok(Layout {
            covariates: covariates
                .iter()
                .map(|c| locate(c.name()))
                .collect::<Result<_, _>>()?,
            responses: response_columns
                .iter()
                .map(|c| locate(c))
                .collect::<Result<_, _>>()?,
            n_columns: header.len(),
        })
    }

    fn csv_error(&self, e: csv::Error) -> IoError {
        IoError::CsvParse {
            path: self.path.clone(),
            offset: e.position().map_or(0, |p| p.byte()),
            source: e,
        }
    }
}

fn parse_delta(raw: &str) -> Option<u32> {
    raw.parse().ok()
}

fn parse_time(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn covariates() -> Vec<Covariate> {
        vec![
            Covariate::numeric("age", 0),
            Covariate::boolean("treated", 1),
            Covariate::factor("grade", 2, vec!["low".into(), "high".into()]).unwrap(),
        ]
    }

    #[test]
    fn read_competing_risk_rows() {
        let csv = "id,age,treated,grade,delta,time\n\
                   a,61.5,true,low,1,2.5\n\
                   b,NA,0,high,0,4.0\n\
                   c,48,false,,2,1.25\n";
        let f = write_csv(csv);
        let rows = RowReader::new(f.path())
            .read_competing_risk(&covariates(), "delta", "time")
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id(), 0);
        assert_eq!(rows[2].id(), 2);
        assert_eq!(rows[0].value(0), CovariateValue::Numeric(61.5));
        assert_eq!(rows[0].value(1), CovariateValue::Boolean(true));
        assert_eq!(rows[0].value(2), CovariateValue::Factor(0));
        assert!(rows[1].value(0).is_missing());
        assert_eq!(rows[1].value(2), CovariateValue::Factor(1));
        assert!(rows[2].value(2).is_missing());
        assert_eq!(*rows[0].response(), CompetingRiskResponse::new(1, 2.5));
        assert_eq!(*rows[1].response(), CompetingRiskResponse::new(0, 4.0));
    }

    #[test]
    fn missing_values_are_noted_on_covariate() {
        let csv = "age,y\n1.0,2.0\nna,3.0\n";
        let f = write_csv(csv);
        let covariates = vec![Covariate::numeric("age", 0)];
        RowReader::new(f.path())
            .read_regression(&covariates, "y")
            .unwrap();
        assert!(covariates[0].has_missing());
    }

    #[test]
    fn columns_located_by_name() {
        let csv = "y,unused,age\n3.0,zzz,10\n";
        let f = write_csv(csv);
        let rows = RowReader::new(f.path())
            .read_regression(&[Covariate::numeric("age", 0)], "y")
            .unwrap();
        assert_eq!(rows[0].value(0), CovariateValue::Numeric(10.0));
        assert_eq!(*rows[0].response(), 3.0);
    }

    #[test]
    fn censor_time_column_read() {
        let csv = "age,d,u,c\n1,1,0.5,3.0\n2,0,3.0,3.0\n";
        let f = write_csv(csv);
        let rows = RowReader::new(f.path())
            .read_competing_risk_with_censor_time(&[Covariate::numeric("age", 0)], "d", "u", "c")
            .unwrap();
        assert_eq!(
            *rows[0].response(),
            CompetingRiskResponseWithCensorTime::new(1, 0.5, 3.0)
        );
    }

    #[test]
    fn covariates_only() {
        let csv = "age\n1\n2\n";
        let f = write_csv(csv);
        let rows = RowReader::new(f.path())
            .read_covariates(&[Covariate::numeric("age", 0)])
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn file_not_found() {
        let err = RowReader::new(Path::new("/nonexistent/rows.csv"))
            .read_covariates(&covariates())
            .unwrap_err();
        assert!(matches!(err, IoError::FileNotFound { .. }));
    }

    #[test]
    fn missing_column() {
        let f = write_csv("age,treated\n1,true\n");
        let err = RowReader::new(f.path())
            .read_covariates(&covariates())
            .unwrap_err();
        match err {
            IoError::MissingColumn { column, .. } => assert_eq!(column, "grade"),
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn empty_dataset() {
        let f = write_csv("age,y\n");
        let err = RowReader::new(f.path())
            .read_regression(&[Covariate::numeric("age", 0)], "y")
            .unwrap_err();
        assert!(matches!(err, IoError::EmptyDataset { .. }));
    }

    #[test]
    fn inconsistent_row_length() {
        let f = write_csv("age,y\n1,2\n3\n");
        let err = RowReader::new(f.path())
            .read_regression(&[Covariate::numeric("age", 0)], "y")
            .unwrap_err();
        match err {
            IoError::InconsistentRowLength {
                row_index,
                expected,
                got,
                ..
            } => {
                assert_eq!(row_index, 1);
                assert_eq!(expected, 2);
                assert_eq!(got, 1);
            }
            other => panic!("expected InconsistentRowLength, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_level_rejected() {
        let f = write_csv("age,treated,grade\n1,true,medium\n");
        let err = RowReader::new(f.path())
            .read_covariates(&covariates())
            .unwrap_err();
        match err {
            IoError::InvalidValue {
                row_index,
                source: larch_rf::ForestError::UnknownLevel { level, .. },
                ..
            } => {
                assert_eq!(row_index, 0);
                assert_eq!(level, "medium");
            }
            other => panic!("expected InvalidValue(UnknownLevel), got {other:?}"),
        }
    }

    #[test]
    fn unparsable_number_rejected() {
        let f = write_csv("age,y\nold,1\n");
        let err = RowReader::new(f.path())
            .read_regression(&[Covariate::numeric("age", 0)], "y")
            .unwrap_err();
        assert!(matches!(
            err,
            IoError::InvalidValue {
                source: larch_rf::ForestError::UnparsableNumber { .. },
                ..
            }
        ));
    }

    #[test]
    fn bad_response_names_column() {
        let f = write_csv("age,d,u\n1,1,0.5\n2,x,1.0\n");
        let err = RowReader::new(f.path())
            .read_competing_risk(&[Covariate::numeric("age", 0)], "d", "u")
            .unwrap_err();
        match err {
            IoError::InvalidResponse {
                row_index,
                column,
                raw,
                ..
            } => {
                assert_eq!(row_index, 1);
                assert_eq!(column, "d");
                assert_eq!(raw, "x");
            }
            other => panic!("expected InvalidResponse, got {other:?}"),
        }
    }

    #[test]
    fn missing_response_rejected() {
        let f = write_csv("age,y\n1,NA\n");
        let err = RowReader::new(f.path())
            .read_regression(&[Covariate::numeric("age", 0)], "y")
            .unwrap_err();
        assert!(matches!(err, IoError::InvalidResponse { .. }));
    }
}
