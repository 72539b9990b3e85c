mod extraction;
mod oracle;

pub use extraction::{ExtractionClient, ExtractionSettings};
pub use oracle::{OpenAiOracle, Oracle, OracleError};
