pub mod ingestor;

pub use ingestor::{EventIngestor, IngestStats};
