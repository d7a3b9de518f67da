//! Run controller
//!
//! The RunController owns one load run from start to finish:
//! - Summarizing the input once and arming the stop coordinator
//! - Opening one service session per actor
//! - Spawning producer and consumer workers
//! - Stopping the run on Ctrl+C or when every producer is done
//! - Aggregating worker statistics
//!
//! # Example
//!
//! ```ignore
//! use flowload_core::controller::RunControllerBuilder;
//!
//! let (controller, records_rx) = RunControllerBuilder::new()
//!     .config(config)
//!     .factory(factory)
//!     .source(source)
//!     .build()?;
//!
//! let stats = controller.run_with_signal_handling().await?;
//! ```

mod aggregator;
mod builder;
mod executor;

pub use aggregator::{aggregate_worker_stats, AggregatedStats};
pub use builder::RunControllerBuilder;
pub use executor::RunController;

#[cfg(test)]
mod tests;
