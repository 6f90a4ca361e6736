pub mod geo;
pub mod reputation;

pub use geo::{GeoEnricher, GeoProvider, RequestPacer};
pub use reputation::{BlacklistPage, ReputationClient, ReputationSource};
