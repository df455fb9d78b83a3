/// AMQP consumer loop and the per-delivery outcome state machine
///
/// Each worker owns one connection and one channel. The outcome state
/// machine is the only place that maps processing errors to broker
/// actions: ack, nack towards the retry queue, or park in the dead queue
/// once the retry budget is spent.
use crate::broker::topology::{ROUTING_KEY_DEAD, Topology};
use crate::constants::{CONNECT_MAX_ATTEMPTS, MAX_DELIVERY_RETRIES, METRICS_LOG_INTERVAL};
use crate::context::SinkContext;
use crate::error::MailSinkError;
use crate::handlers::processor::{Disposition, process_message};
use crate::services::config::Config;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Runs one worker until its delivery stream ends. Connection, channel,
/// and topology failures are fatal for the worker; the supervisor decides
/// what that means for the process.
pub async fn run(worker_id: usize, ctx: Arc<SinkContext>) -> Result<(), MailSinkError> {
    let connection = connect_with_retry(worker_id, &ctx.config.amqp_url(), &ctx.config).await?;
    let channel = connection.create_channel().await?;

    let topology = Topology::new(&ctx.config.rabbitmq_queue);
    topology.declare(&channel).await?;

    let mut consumer = channel
        .basic_consume(
            &topology.main_queue,
            &format!("mailsink-worker-{worker_id}"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(
        worker = worker_id,
        queue = %topology.main_queue,
        "worker started, waiting for messages"
    );

    let metrics = WorkerMetrics::default();
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => {
                handle_delivery(worker_id, delivery, &channel, &topology, &ctx, &metrics).await;
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "failed to receive delivery");
            }
        }
    }

    info!(worker = worker_id, "delivery stream closed, worker exiting");
    Ok(())
}

/// Connects to the broker with exponential backoff: up to
/// `CONNECT_MAX_ATTEMPTS` tries, sleeping 2^(attempt-1) seconds after each
/// failure.
async fn connect_with_retry(
    worker_id: usize,
    uri: &str,
    config: &Config,
) -> Result<Connection, MailSinkError> {
    // When a CA bundle is configured it becomes the trust root for the
    // amqps session; otherwise lapin verifies against the system roots.
    let cert_chain = if config.rabbitmq_use_ssl && !config.rabbitmq_ssl_ca.is_empty() {
        let pem = std::fs::read_to_string(&config.rabbitmq_ssl_ca).map_err(|e| {
            MailSinkError::Config(format!(
                "cannot read RABBITMQ_SSL_CA {}: {e}",
                config.rabbitmq_ssl_ca
            ))
        })?;
        Some(pem)
    } else {
        None
    };

    let mut attempt = 1;
    loop {
        let result = match &cert_chain {
            Some(pem) => {
                Connection::connect_with_config(
                    uri,
                    ConnectionProperties::default(),
                    OwnedTLSConfig {
                        identity: None,
                        cert_chain: Some(pem.clone()),
                    },
                )
                .await
            }
            None => Connection::connect(uri, ConnectionProperties::default()).await,
        };

        match result {
            Ok(connection) => {
                info!(worker = worker_id, "connected to broker");
                return Ok(connection);
            }
            Err(e) => {
                let wait = backoff_delay(attempt);
                warn!(
                    worker = worker_id,
                    attempt,
                    max = CONNECT_MAX_ATTEMPTS,
                    error = %e,
                    wait_secs = wait.as_secs(),
                    "connection failed, retrying"
                );
                tokio::time::sleep(wait).await;

                if attempt >= CONNECT_MAX_ATTEMPTS {
                    return Err(MailSinkError::Broker(e));
                }
                attempt += 1;
            }
        }
    }
}

/// 1, 2, 4, 8, 16 seconds for attempts 1 through 5.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1))
}

/// Broker action chosen for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Success (delivered or deduplicated): ack.
    Ack,
    /// Permanent failure: ack so the message leaves the queue for good.
    Drop,
    /// Transient failure with budget left: nack towards the retry queue.
    Retry,
    /// Budget exhausted: publish to the dead queue, then ack.
    Park,
}

fn classify(result: &Result<Disposition, MailSinkError>, retry_count: i64) -> Verdict {
    match result {
        Ok(_) => Verdict::Ack,
        Err(e) if !e.is_retriable() => Verdict::Drop,
        Err(_) if retry_count + 1 > MAX_DELIVERY_RETRIES => Verdict::Park,
        Err(_) => Verdict::Retry,
    }
}

async fn handle_delivery(
    worker_id: usize,
    delivery: Delivery,
    channel: &Channel,
    topology: &Topology,
    ctx: &SinkContext,
    metrics: &WorkerMetrics,
) {
    let retry_count = retry_count_from_headers(delivery.properties.headers().as_ref());
    let result = process_message(worker_id, &delivery.data, ctx).await;
    let verdict = classify(&result, retry_count);

    match verdict {
        Verdict::Ack => {
            ack(worker_id, &delivery).await;
        }
        Verdict::Drop => {
            ack(worker_id, &delivery).await;
            error!(
                worker = worker_id,
                raw = %String::from_utf8_lossy(&delivery.data),
                "invalid message removed from queue (permanent failure)"
            );
        }
        Verdict::Retry => {
            if let Err(e) = delivery
                .acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
            {
                error!(worker = worker_id, error = %e, "failed to nack message");
            }
            if let Err(e) = &result {
                warn!(
                    worker = worker_id,
                    retry_count,
                    error = %e,
                    "transient failure, message sent to retry queue"
                );
            }
        }
        Verdict::Park => {
            park(worker_id, &delivery, channel, topology, retry_count).await;
        }
    }

    let handled = metrics.record(verdict == Verdict::Ack);
    if handled % METRICS_LOG_INTERVAL == 0 {
        info!(
            worker = worker_id,
            processed = metrics.processed(),
            failed = metrics.failed(),
            "delivery metrics"
        );
    }
}

async fn ack(worker_id: usize, delivery: &Delivery) {
    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
        error!(
            worker = worker_id,
            error = %e,
            raw = %String::from_utf8_lossy(&delivery.data),
            "failed to ack message"
        );
    }
}

/// Parks a message whose retry budget is spent: publish the body to the
/// dead queue, then ack the original. The ack happens even when the
/// publish fails; the message must not stay in flight forever.
async fn park(
    worker_id: usize,
    delivery: &Delivery,
    channel: &Channel,
    topology: &Topology,
    retry_count: i64,
) {
    if let Err(e) = publish_dead(delivery, channel, topology, retry_count).await {
        error!(
            worker = worker_id,
            retry_count,
            error = %e,
            "failed to publish to dead queue"
        );
    }
    ack(worker_id, delivery).await;
    warn!(
        worker = worker_id,
        retry_count, "max retries reached, message sent to dead queue"
    );
}

async fn publish_dead(
    delivery: &Delivery,
    channel: &Channel,
    topology: &Topology,
    retry_count: i64,
) -> Result<(), lapin::Error> {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("x-retry-count"),
        AMQPValue::LongLongInt(retry_count),
    );

    let mut properties = BasicProperties::default().with_headers(headers);
    if let Some(content_type) = delivery.properties.content_type().clone() {
        properties = properties.with_content_type(content_type);
    }

    channel
        .basic_publish(
            &topology.dlx_exchange,
            ROUTING_KEY_DEAD,
            BasicPublishOptions::default(),
            &delivery.data,
            properties,
        )
        .await?
        .await?;

    Ok(())
}

/// Reads the retry counter off the broker-injected `x-death` header:
/// first entry's `count` field. Header table values are runtime-tagged,
/// so every shape mismatch degrades to zero.
fn retry_count_from_headers(headers: Option<&FieldTable>) -> i64 {
    let Some(headers) = headers else { return 0 };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(&ShortString::from("x-death"))
    else {
        return 0;
    };
    let Some(AMQPValue::FieldTable(first)) = deaths.as_slice().first() else {
        return 0;
    };
    first
        .inner()
        .get(&ShortString::from("count"))
        .and_then(amqp_int)
        .unwrap_or(0)
}

fn amqp_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Per-worker delivery counters. Increments are atomic; the periodic log
/// line reads them independently.
#[derive(Default)]
struct WorkerMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerMetrics {
    /// Records one handled delivery and returns the running total.
    fn record(&self, success: bool) -> u64 {
        if success {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.processed() + self.failed()
    }

    fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
