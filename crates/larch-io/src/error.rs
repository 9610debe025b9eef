//! I/O error types for larch-io.

use std::path::PathBuf;

use larch_rf::ForestError;

/// Errors from row ingestion and settings persistence.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Returned when the input file does not exist or is unreadable.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when the CSV parser encounters a malformed record.
    #[error("CSV parse error in {path} at byte offset {offset}")]
    CsvParse {
        /// Path to the CSV file.
        path: PathBuf,
        /// Byte offset where the error occurred.
        offset: u64,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Returned when the CSV file contains a header but zero data rows.
    #[error("empty dataset (no data rows) in {path}")]
    EmptyDataset {
        /// Path to the CSV file.
        path: PathBuf,
    },

    /// Returned when a column named by a covariate or the response is absent from the header.
    #[error("column \"{column}\" not found in header of {path}")]
    MissingColumn {
        /// Path to the CSV file.
        path: PathBuf,
        /// The absent column name.
        column: String,
    },

    /// Returned when a data row has a different number of columns than the header.
    #[error("inconsistent row length in {path}: row {row_index} has {got} columns, expected {expected}")]
    InconsistentRowLength {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// Expected number of columns (from header).
        expected: usize,
        /// Actual number of columns in this row.
        got: usize,
    },

    /// Returned when a covariate cell cannot be converted to its covariate's type.
    #[error("invalid covariate value in {path}: row {row_index}")]
    InvalidValue {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// The covariate's parse error.
        source: ForestError,
    },

    /// Returned when a response cell is missing or cannot be parsed.
    #[error("invalid response in {path}: row {row_index}, column \"{column}\", raw value \"{raw}\"")]
    InvalidResponse {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// Response column name.
        column: String,
        /// The raw text that failed to parse.
        raw: String,
    },

    /// Returned when a settings bundle cannot be parsed from JSON.
    #[error("invalid settings JSON")]
    SettingsParse {
        /// Underlying serde_json error, naming the offending field.
        source: serde_json::Error,
    },

    /// Returned when a settings bundle cannot be encoded as JSON.
    #[error("cannot encode settings as JSON")]
    SettingsEncode {
        /// Underlying serde_json error.
        source: serde_json::Error,
    },

    /// Returned when settings are self-inconsistent.
    #[error("invalid settings field \"{field}\": {reason}")]
    InvalidSettings {
        /// The offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Returned when a settings value is rejected by the core library.
    #[error("settings rejected")]
    Forest {
        /// The core library's error.
        #[from]
        source: ForestError,
    },

    /// Returned when a file cannot be written.
    #[error("cannot write file {path}")]
    WriteFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
