//! Row ingestion and settings persistence for larch.

mod error;
mod reader;
mod settings;

pub use error::IoError;
pub use reader::RowReader;
pub use settings::{
    CombinerSettings, CovariateSettings, ForestSettings, ResponseSettings, SplitFinderSettings,
};
