//! Worker side: consumer loop and priority dispatch.

pub mod consumer;
pub mod dispatcher;

pub use consumer::{ConsumerConfig, ConsumerLoop, ConsumerStats};
pub use dispatcher::{Dispatcher, Disposition};
