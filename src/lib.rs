pub mod clock;
pub mod config;
pub mod driver;
pub mod ids;
pub mod logging;
pub mod payload;
pub mod relay;
pub mod tally;
pub mod valuation;
