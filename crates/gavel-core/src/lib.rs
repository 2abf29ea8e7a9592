pub mod clock;
pub mod driver;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod scoring;
pub mod store;
pub mod sweep;

pub use engine::{AuctionEngine, AuctionTiming};
pub use error::{AuctionError, AuctionResult};
pub use store::Database;
