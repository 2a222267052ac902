//! At-least-once message queue for the Roster audit pipeline.
//!
//! Producers [`send`](MessageQueue::send) messages; consumers
//! [`receive`](MessageQueue::receive) them together with a receipt and
//! [`ack`](MessageQueue::ack) once processing is durable. A received message
//! that is not acknowledged within the visibility timeout becomes visible
//! again and is redelivered. Messages older than the retention window are
//! dropped.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use roster_queue::{InMemoryQueue, MessageQueue, QueueConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let queue = InMemoryQueue::<String>::new(QueueConfig::default());
//! queue.send("hello".to_string()).await.unwrap();
//!
//! let deliveries = queue.receive(10, Duration::ZERO).await.unwrap();
//! assert_eq!(deliveries[0].body, "hello");
//! queue.ack(&deliveries[0].receipt).await.unwrap();
//! # });
//! ```

mod config;
mod error;
mod memory;
mod queue;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use error::{QueueError, QueueResult};
pub use memory::InMemoryQueue;
pub use queue::{deliveries, Delivery, MessageId, MessageQueue, QueueDepth, ReceiptHandle};
