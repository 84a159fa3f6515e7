// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # membroker
//!
//! A bounded, in-memory event broker sitting between producers (collectors) and consumers
//! (output workers) of a publishing pipeline.
//!
//! ## Architecture
//!
//! Each [`Broker`] runs two tasks:
//! - the coordination loop, sole owner of the two-region ring buffer, serving insert, cancel,
//!   reservation and metrics requests over channels;
//! - the ACK loop, which turns out-of-order batch acknowledgements into
//!   in-order reclamation reports and per-producer ACK callbacks.
//!
//! [`Producer`] and [`Consumer`] handles only talk to those tasks through message queues. Every
//! blocking call also waits on the broker's shutdown token, so closing the broker releases all
//! callers.
//!
//! ```no_run
//! use membroker::{Broker, Event, ProducerConfig, Settings};
//!
//! # async fn run() -> Result<(), membroker::BrokerError> {
//! let broker = Broker::new(&Settings::from_env()?);
//! let mut producer = broker.producer(ProducerConfig::new().with_ack(|n| println!("{n} acked")));
//! let consumer = broker.consumer();
//!
//! if let Some(id) = producer.publish(Event::new("hello")).await {
//!     println!("stored as entry {id}");
//! }
//! let batch = consumer.get(10).await?;
//! batch.ack();
//! broker.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![deny(unused_extern_crates)]

mod ack_loop;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
mod event_loop;
pub mod producer;
mod ring_buffer;

pub use broker::{Broker, BrokerMetrics};
pub use config::Settings;
pub use consumer::{Batch, Consumer};
pub use error::BrokerError;
pub use event::{EntryId, Event};
pub use producer::{AckCallback, DropCallback, Producer, ProducerConfig};
