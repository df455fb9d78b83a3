/// Queue and exchange declarations for the main/retry/dead triplet
///
/// A rejected delivery leaves the main queue through its dead-letter
/// exchange on key `retry` and parks in the retry queue, whose per-message
/// TTL dead-letters it back to the main exchange on key `process`. The
/// broker records each hop in `x-death`, which is the retry counter the
/// worker reads. Terminal failures are published straight to the dead
/// queue on key `dead`.
use crate::constants::RETRY_QUEUE_TTL_MS;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, ExchangeKind};

pub const ROUTING_KEY_PROCESS: &str = "process";
pub const ROUTING_KEY_RETRY: &str = "retry";
pub const ROUTING_KEY_DEAD: &str = "dead";

/// Entity names derived from the base queue name.
#[derive(Debug, Clone)]
pub struct Topology {
    pub main_queue: String,
    pub main_exchange: String,
    pub dlx_exchange: String,
    pub retry_queue: String,
    pub dead_queue: String,
}

impl Topology {
    pub fn new(base_queue: &str) -> Self {
        Self {
            main_queue: base_queue.to_string(),
            main_exchange: format!("{base_queue}_exchange"),
            dlx_exchange: format!("{base_queue}_dlx"),
            retry_queue: format!("{base_queue}_retry"),
            dead_queue: format!("{base_queue}_dead"),
        }
    }

    /// Declares exchanges, queues, and bindings on the channel.
    ///
    /// Declarations are idempotent against identical broker state; a
    /// mismatch with an existing entity's arguments fails the channel,
    /// which is fatal for the worker that opened it.
    pub async fn declare(&self, channel: &Channel) -> Result<(), lapin::Error> {
        let durable_exchange = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        channel
            .exchange_declare(
                &self.main_exchange,
                ExchangeKind::Direct,
                durable_exchange,
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(
                &self.dlx_exchange,
                ExchangeKind::Direct,
                durable_exchange,
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(&self.main_queue, durable_queue, self.main_queue_args())
            .await?;
        channel
            .queue_declare(&self.retry_queue, durable_queue, self.retry_queue_args())
            .await?;
        channel
            .queue_declare(&self.dead_queue, durable_queue, FieldTable::default())
            .await?;

        channel
            .queue_bind(
                &self.main_queue,
                &self.main_exchange,
                ROUTING_KEY_PROCESS,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.retry_queue,
                &self.dlx_exchange,
                ROUTING_KEY_RETRY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.dead_queue,
                &self.dlx_exchange,
                ROUTING_KEY_DEAD,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Rejected messages leave the main queue towards the retry queue.
    fn main_queue_args(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(self.dlx_exchange.as_str().into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(ROUTING_KEY_RETRY.into()),
        );
        args
    }

    /// Expired messages flow back to the main exchange after the delay.
    fn retry_queue_args(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(self.main_exchange.as_str().into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(ROUTING_KEY_PROCESS.into()),
        );
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongInt(RETRY_QUEUE_TTL_MS),
        );
        args
    }
}
