//! Worker module for driving actors
//!
//! A Worker owns one [`Actor`] and runs the loop:
//! **start -> iterate -> report -> think -> repeat**.
//!
//! 1. `on_start` authenticates (consumers also wait for the first artifact)
//! 2. Before each iteration the run's stop signal is checked
//! 3. The iteration result is recorded into the stop coordinator (producers)
//!    and sent to the collector over an mpsc channel
//! 4. A random think time is slept, cut short if the run stops
//!
//! Producers leave once their quota is reached. An actor whose credentials
//! are refused is retired, which still counts it as finished so the run can
//! end.
//!
//! # Example
//!
//! ```ignore
//! use flowload_core::worker::{ProducerActor, WorkerBuilder};
//!
//! let worker = WorkerBuilder::new()
//!     .actor(Box::new(producer))
//!     .context(ctx.clone())
//!     .records_tx(tx)
//!     .build()?;
//!
//! let stats = worker.run().await?;
//! println!("Completed: {}", stats.completed);
//! ```

mod actor;
mod builder;
mod executor;
mod stats;

pub use actor::{Actor, ConsumerActor, ProducerActor};
pub use builder::WorkerBuilder;
pub use executor::Worker;
pub use stats::WorkerStats;

#[cfg(test)]
mod tests;
