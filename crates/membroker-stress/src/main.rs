// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use membroker::{Broker, Event, ProducerConfig, Settings};

const DEFAULT_PRODUCERS: usize = 4;
const DEFAULT_CONSUMERS: usize = 2;
const DEFAULT_EVENTS_PER_PRODUCER: usize = 100_000;
const DEFAULT_BATCH_SIZE: usize = 512;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(val) => val.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {key} value '{val}', using {default}");
            default
        }),
        Err(_) => default,
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("MEMBROKER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("Error loading broker settings: {e}");
            return;
        }
    };
    let producers = env_usize("MEMBROKER_STRESS_PRODUCERS", DEFAULT_PRODUCERS).max(1);
    let consumers = env_usize("MEMBROKER_STRESS_CONSUMERS", DEFAULT_CONSUMERS).max(1);
    let events_per_producer =
        env_usize("MEMBROKER_STRESS_EVENTS", DEFAULT_EVENTS_PER_PRODUCER).max(1);
    let batch_size = env_usize("MEMBROKER_STRESS_BATCH_SIZE", DEFAULT_BATCH_SIZE);
    let total = producers * events_per_producer;

    info!(
        "Driving broker ({} slots, flush_min_events {}, flush_timeout {:?}) with {} producers x {} events and {} consumers",
        settings.events,
        settings.flush_min_events,
        settings.flush_timeout,
        producers,
        events_per_producer,
        consumers
    );

    let reported = Arc::new(AtomicUsize::new(0));
    let observer_count = Arc::clone(&reported);
    let broker = Broker::with_ack_observer(&settings, move |n| {
        observer_count.fetch_add(n, Ordering::Relaxed);
    });

    let acked = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut consumer_tasks = Vec::with_capacity(consumers);
    for id in 0..consumers {
        let consumer = broker.consumer();
        let consumed = Arc::clone(&consumed);
        consumer_tasks.push(tokio::spawn(async move {
            let mut batches = 0usize;
            while let Ok(mut batch) = consumer.get(batch_size).await {
                let events = batch.take_events();
                consumed.fetch_add(events.len(), Ordering::Relaxed);
                batches += 1;
                batch.ack();
            }
            debug!("Consumer {id} stopped after {batches} batches");
        }));
    }

    let mut producer_tasks = Vec::with_capacity(producers);
    for id in 0..producers {
        let acked = Arc::clone(&acked);
        let dropped = Arc::clone(&dropped);
        let mut producer = broker.producer(
            ProducerConfig::new()
                .with_ack(move |n| {
                    acked.fetch_add(n, Ordering::Relaxed);
                })
                .with_drop(move |n| {
                    dropped.fetch_add(n, Ordering::Relaxed);
                }),
        );
        producer_tasks.push(tokio::spawn(async move {
            let mut published = 0usize;
            for seq in 0..events_per_producer {
                if producer.publish(Event::new((id, seq))).await.is_none() {
                    warn!("Producer {id} stopped publishing after {published} events");
                    break;
                }
                published += 1;
            }
            (producer, published)
        }));
    }

    let reporter_cancel = CancellationToken::new();
    let reporter = {
        let cancel = reporter_cancel.clone();
        let acked = Arc::clone(&acked);
        let consumed = Arc::clone(&consumed);
        async move {
            let mut report_interval = interval(REPORT_INTERVAL);
            report_interval.tick().await; // discard first tick, which is instantaneous
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = report_interval.tick() => {
                        info!(
                            "Progress: {} consumed, {} acked of up to {}",
                            consumed.load(Ordering::Relaxed),
                            acked.load(Ordering::Relaxed),
                            total
                        );
                    }
                }
            }
        }
    };
    let reporter_task = tokio::spawn(reporter);

    let mut handles = Vec::with_capacity(producers);
    let mut published = 0usize;
    for task in producer_tasks {
        match task.await {
            Ok((producer, count)) => {
                handles.push(producer);
                published += count;
            }
            Err(e) => error!("Producer task failed: {e}"),
        }
    }
    if published < total {
        warn!("Only {published} of {total} events were published");
    }

    let mut wait = interval(Duration::from_millis(10));
    while acked.load(Ordering::Relaxed) + dropped.load(Ordering::Relaxed) < published {
        wait.tick().await;
        if started.elapsed() > Duration::from_secs(600) {
            error!("Gave up waiting for acknowledgements");
            break;
        }
    }
    let elapsed = started.elapsed();

    match broker.metrics().await {
        Ok(metrics) => info!(
            "Broker: {} buffered, {} reserved, {} acknowledged, limit {}, oldest entry {}",
            metrics.event_count,
            metrics.unacked_consumed_events,
            metrics.acked_events,
            metrics.event_limit,
            metrics.oldest_entry_id
        ),
        Err(e) => warn!("Could not read broker metrics: {e}"),
    }

    reporter_cancel.cancel();
    broker.close().await;
    for task in consumer_tasks {
        if let Err(e) = task.await {
            error!("Consumer task failed: {e}");
        }
    }
    let _ = reporter_task.await;

    for (id, producer) in handles.into_iter().enumerate() {
        debug!(
            "Producer {id} last acknowledged sequence {}",
            producer.last_acked_sequence()
        );
        producer.close();
    }

    #[allow(clippy::cast_precision_loss)]
    let rate = consumed.load(Ordering::Relaxed) as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        "Done in {:?}: {} published, {} consumed, {} acked ({} via observer), {} dropped, {:.0} events/s",
        elapsed,
        published,
        consumed.load(Ordering::Relaxed),
        acked.load(Ordering::Relaxed),
        reported.load(Ordering::Relaxed),
        dropped.load(Ordering::Relaxed),
        rate
    );
}
