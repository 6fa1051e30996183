//! Slicer Worker Library
//!
//! Core of a background worker that turns 3-D model files into G-code by
//! handing them to an external slicer. Jobs arrive on a leased queue, model
//! files and toolpaths live in an object store.
//!
//! ## Module Overview
//!
//! - `config`: environment-driven worker configuration
//! - `converter`: converter registry and subprocess invocation
//! - `error`: error taxonomy (transient vs. permanent)
//! - `job`: job records and status transitions
//! - `pipeline`: the poll / fetch / convert / upload / publish state machine
//! - `queue`: queue trait and Redis Streams adapter
//! - `retry`: bounded exponential backoff
//! - `store`: object store trait and S3 adapter
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slicer_worker::{
//!     config::WorkerConfig,
//!     converter::ConverterInvoker,
//!     pipeline::Pipeline,
//!     queue::RedisStreamQueue,
//!     store::S3ObjectStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::from_env()?;
//!
//!     let client = redis::Client::open(config.redis_url.as_str())?;
//!     let conn = redis::aio::ConnectionManager::new(client).await?;
//!     let queue = RedisStreamQueue::new(
//!         conn,
//!         config.consumer_group.clone(),
//!         config.consumer_name.clone(),
//!         config.receive_wait,
//!     );
//!     queue.ensure_group(&config.input_queue).await?;
//!
//!     let store = S3ObjectStore::new(config.s3.clone()).await?;
//!     let converter = ConverterInvoker::new(config.converter_registry(), config.converter_timeout);
//!
//!     let pipeline = Pipeline::new(
//!         Arc::new(queue),
//!         Arc::new(store),
//!         converter,
//!         config.pipeline_settings(),
//!     );
//!     let outcome = pipeline.poll_once().await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod converter;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
