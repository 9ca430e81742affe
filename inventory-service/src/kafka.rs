//! Kafka transport for inventory messages.
//!
//! Offsets are committed manually and only up to the first delivery that has
//! not been settled yet, so deliveries processed concurrently never commit
//! past one another. Requeue and dead-letter are done by republishing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use shared::headers;
use tracing::{error, info, warn};

use crate::reliability::{BrokerError, Delivery, DeliveryChannel, DeliveryTag, ReplyTo};
use crate::supervisor::Connector;

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub dead_letter_topic: String,
    pub connect_timeout: Duration,
    pub max_pending_offsets: usize,
}

/// Creates a fresh consumer/producer pair per connection attempt.
pub struct KafkaConnector {
    settings: KafkaSettings,
    sessions: AtomicU64,
}

impl KafkaConnector {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            sessions: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    type Connection = KafkaSession;

    fn endpoint(&self) -> String {
        self.settings.brokers.clone()
    }

    async fn connect(&self) -> Result<KafkaSession> {
        let settings = &self.settings;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &settings.group_id)
            .set("bootstrap.servers", &settings.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        // Client creation is lazy; fetching metadata proves the brokers answer.
        let consumer = Arc::new(consumer);
        let metadata_client = Arc::clone(&consumer);
        let timeout = settings.connect_timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            metadata_client
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await??;

        let topics: Vec<&str> = settings.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session, brokers, topics = ?settings.topics, "Connected to Kafka");

        Ok(KafkaSession {
            consumer: Arc::clone(&consumer),
            channel: Arc::new(KafkaChannel {
                session,
                consumer,
                producer,
                dead_letter_topic: settings.dead_letter_topic.clone(),
                offsets: Mutex::new(OffsetTracker::with_max_pending(settings.max_pending_offsets)),
            }),
        })
    }
}

pub struct KafkaSession {
    consumer: Arc<StreamConsumer>,
    channel: Arc<KafkaChannel>,
}

impl KafkaSession {
    pub fn channel(&self) -> Arc<KafkaChannel> {
        Arc::clone(&self.channel)
    }

    /// Deliveries from the subscribed topics. Each one is tracked for offset
    /// commits before it is handed out.
    pub fn deliveries(&self) -> impl Stream<Item = Delivery> + '_ {
        self.consumer.stream().filter_map(move |message| {
            let delivery = match message {
                Ok(message) => Some(self.channel.accept(&message)),
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    None
                }
            };
            futures::future::ready(delivery)
        })
    }
}

pub struct KafkaChannel {
    session: u64,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    dead_letter_topic: String,
    offsets: Mutex<OffsetTracker>,
}

impl KafkaChannel {
    fn accept(&self, message: &BorrowedMessage<'_>) -> Delivery {
        let mut redelivery_count = 0;
        let mut reply_destination = None;
        let mut correlation_id = None;

        if let Some(message_headers) = message.headers() {
            for header in message_headers.iter() {
                let value = header
                    .value
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .map(str::to_string);
                match header.key {
                    headers::REDELIVERY_COUNT => {
                        redelivery_count = value.and_then(|v| v.parse().ok()).unwrap_or(0)
                    }
                    headers::REPLY_TO => reply_destination = value,
                    headers::CORRELATION_ID => correlation_id = value,
                    _ => {}
                }
            }
        }

        let saturated = self
            .offsets_guard()
            .track(message.topic(), message.partition(), message.offset());
        if saturated {
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                "Too many unsettled offsets, pausing partition"
            );
            self.set_paused(message.topic(), message.partition(), true);
        }

        Delivery {
            tag: DeliveryTag {
                session: self.session,
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            redelivery_count,
            reply_to: reply_destination.map(|destination| ReplyTo {
                destination,
                correlation_id,
            }),
        }
    }

    fn offsets_guard(&self) -> std::sync::MutexGuard<'_, OffsetTracker> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_paused(&self, topic: &str, partition: i32, paused: bool) {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        let result = if paused {
            self.consumer.pause(&tpl)
        } else {
            self.consumer.resume(&tpl)
        };
        if let Err(e) = result {
            error!(topic, partition, paused, "Failed to change partition flow: {}", e);
        }
    }

    fn check_session(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        if tag.session != self.session {
            return Err(BrokerError::StaleTag {
                tag: tag.clone(),
                current: self.session,
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        message_headers: OwnedHeaders,
    ) -> Result<(), BrokerError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic)
            .payload(payload)
            .headers(message_headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Io(format!("failed to publish to {topic}: {e}")))
    }

    /// Commits every offset up to the first unsettled delivery, waiting for
    /// the broker to confirm. Called once the consumer has drained.
    pub fn flush(&self) -> Result<(), BrokerError> {
        let positions = self.offsets_guard().positions();
        if positions.is_empty() {
            return Ok(());
        }
        let tpl = partition_list(&positions).map_err(|e| BrokerError::Io(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::Io(e.to_string()))
    }
}

#[async_trait]
impl DeliveryChannel for KafkaChannel {
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let tag = &delivery.tag;
        self.check_session(tag)?;

        let (next, resumable) = {
            let mut offsets = self.offsets_guard();
            let next = offsets.settle(&tag.topic, tag.partition, tag.offset);
            (next, offsets.take_resumable(&tag.topic, tag.partition))
        };
        if resumable {
            info!(topic = %tag.topic, partition = tag.partition, "Backlog drained, resuming partition");
            self.set_paused(&tag.topic, tag.partition, false);
        }
        if let Some(next) = next {
            let tpl = partition_list(&[(tag.topic.clone(), tag.partition, next)])
                .map_err(|e| BrokerError::Io(e.to_string()))?;
            self.consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| BrokerError::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, redelivery_count: u32) -> Result<(), BrokerError> {
        self.check_session(&delivery.tag)?;
        let message_headers = delivery_headers(delivery, redelivery_count);
        self.publish(
            &delivery.tag.topic,
            delivery.key.as_deref(),
            &delivery.payload,
            message_headers,
        )
        .await?;
        self.ack(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        self.check_session(&delivery.tag)?;
        let message_headers = delivery_headers(delivery, delivery.redelivery_count)
            .insert(Header {
                key: headers::DEAD_LETTER_REASON,
                value: Some(reason),
            })
            .insert(Header {
                key: headers::SOURCE_TOPIC,
                value: Some(delivery.tag.topic.as_str()),
            });
        self.publish(
            &self.dead_letter_topic,
            delivery.key.as_deref(),
            &delivery.payload,
            message_headers,
        )
        .await?;
        self.ack(delivery).await
    }

    async fn reply(&self, to: &ReplyTo, payload: &[u8]) -> Result<(), BrokerError> {
        let mut message_headers = OwnedHeaders::new();
        if let Some(correlation_id) = &to.correlation_id {
            message_headers = message_headers.insert(Header {
                key: headers::CORRELATION_ID,
                value: Some(correlation_id.as_str()),
            });
        }
        self.publish(&to.destination, None, payload, message_headers)
            .await
    }
}

fn delivery_headers(delivery: &Delivery, redelivery_count: u32) -> OwnedHeaders {
    let count = redelivery_count.to_string();
    let mut message_headers = OwnedHeaders::new().insert(Header {
        key: headers::REDELIVERY_COUNT,
        value: Some(count.as_str()),
    });
    if let Some(reply_to) = &delivery.reply_to {
        message_headers = message_headers.insert(Header {
            key: headers::REPLY_TO,
            value: Some(reply_to.destination.as_str()),
        });
        if let Some(correlation_id) = &reply_to.correlation_id {
            message_headers = message_headers.insert(Header {
                key: headers::CORRELATION_ID,
                value: Some(correlation_id.as_str()),
            });
        }
    }
    message_headers
}

fn partition_list(positions: &[(String, i32, i64)]) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (topic, partition, offset) in positions {
        tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
    }
    Ok(tpl)
}

/// Uncommitted offsets a partition may accumulate before it is paused.
pub const DEFAULT_MAX_PENDING_OFFSETS: usize = 1000;

/// Per-partition bookkeeping of received and settled offsets.
///
/// An unsettled offset holds back the commit position of its partition, so
/// every later offset stays pending behind it. Once a partition has
/// `max_pending` pending offsets it is reported for pausing, and reported
/// for resuming when the backlog has halved.
#[derive(Debug)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
    max_pending: usize,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Received offsets that have not been committed, with their settled flag.
    pending: BTreeMap<i64, bool>,
    /// Next offset to consume, as last committed.
    committed: Option<i64>,
    paused: bool,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING_OFFSETS)
    }
}

impl OffsetTracker {
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            partitions: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Records a received offset. Returns true when the partition has just
    /// reached its pending limit and must be paused.
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) -> bool {
        let offsets = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        offsets.pending.insert(offset, false);

        if !offsets.paused && offsets.pending.len() >= self.max_pending {
            offsets.paused = true;
            return true;
        }
        false
    }

    /// Marks an offset settled. Returns the new commit position when the
    /// settled prefix of the partition grew.
    pub fn settle(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self.partitions.get_mut(&(topic.to_string(), partition))?;
        *offsets.pending.get_mut(&offset)? = true;

        let mut advanced = None;
        while let Some((&first, &settled)) = offsets.pending.first_key_value() {
            if !settled {
                break;
            }
            offsets.pending.remove(&first);
            advanced = Some(first + 1);
        }
        if advanced.is_some() {
            offsets.committed = advanced;
        }
        advanced
    }

    /// Returns true, once, when a paused partition's backlog has drained to
    /// half the limit and it can be resumed.
    pub fn take_resumable(&mut self, topic: &str, partition: i32) -> bool {
        let resume_below = self.max_pending / 2 + 1;
        match self.partitions.get_mut(&(topic.to_string(), partition)) {
            Some(offsets) if offsets.paused && offsets.pending.len() < resume_below => {
                offsets.paused = false;
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, |offsets| offsets.pending.len())
    }

    /// Commit positions of every partition that has made progress.
    pub fn positions(&self) -> Vec<(String, i32, i64)> {
        let mut positions: Vec<_> = self
            .partitions
            .iter()
            .filter_map(|((topic, partition), offsets)| {
                offsets
                    .committed
                    .map(|next| (topic.clone(), *partition, next))
            })
            .collect();
        positions.sort();
        positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_only_the_settled_prefix() {
        let mut tracker = OffsetTracker::default();
        for offset in 10..13 {
            tracker.track("inventory", 0, offset);
        }

        assert_eq!(tracker.settle("inventory", 0, 11), None);
        assert_eq!(tracker.settle("inventory", 0, 10), Some(12));
        assert_eq!(tracker.settle("inventory", 0, 12), Some(13));
        assert_eq!(tracker.positions(), vec![("inventory".to_string(), 0, 13)]);
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        tracker.track("inventory", 0, 5);
        tracker.track("inventory", 1, 7);

        assert_eq!(tracker.settle("inventory", 1, 7), Some(8));
        assert_eq!(tracker.positions(), vec![("inventory".to_string(), 1, 8)]);
    }

    #[test]
    fn unknown_offsets_are_ignored() {
        let mut tracker = OffsetTracker::default();
        assert_eq!(tracker.settle("inventory", 0, 1), None);
        tracker.track("inventory", 0, 1);
        assert_eq!(tracker.settle("inventory", 0, 2), None);
        assert!(tracker.positions().is_empty());
    }

    #[test]
    fn stuck_offset_pauses_the_partition_instead_of_growing() {
        let mut tracker = OffsetTracker::with_max_pending(100);
        assert!(!tracker.track("inventory", 0, 0));

        let mut pauses = 0;
        for offset in 1..10_000 {
            if tracker.track("inventory", 0, offset) {
                pauses += 1;
                break;
            }
            assert_eq!(tracker.settle("inventory", 0, offset), None);
        }

        assert_eq!(pauses, 1);
        assert_eq!(tracker.pending("inventory", 0), 100);
        assert!(!tracker.take_resumable("inventory", 0));
        assert!(tracker.positions().is_empty());
    }

    #[test]
    fn settling_the_stuck_offset_commits_and_resumes() {
        let mut tracker = OffsetTracker::with_max_pending(10);
        for offset in 0..10 {
            tracker.track("inventory", 0, offset);
        }
        for offset in 1..10 {
            tracker.settle("inventory", 0, offset);
        }
        assert_eq!(tracker.pending("inventory", 0), 10);

        assert_eq!(tracker.settle("inventory", 0, 0), Some(10));
        assert_eq!(tracker.pending("inventory", 0), 0);
        assert!(tracker.take_resumable("inventory", 0));
        assert!(!tracker.take_resumable("inventory", 0));
        assert_eq!(tracker.positions(), vec![("inventory".to_string(), 0, 10)]);
    }
}
