use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use shared::MessageEnvelope;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::handlers::{Handled, HandlerError, Router};
use crate::reliability::{
    BrokerError, Delivery, DeliveryChannel, Disposition, MessageState, RedeliveryPolicy,
};

/// Counts of how the deliveries seen by [`MessageConsumer::run`] were settled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub acknowledged: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Deliveries still unsettled when shutdown stopped their settlement
    /// retries; they will be redelivered by the next session.
    pub unsettled: usize,
}

impl RunSummary {
    fn record(&mut self, result: Result<Result<MessageState, BrokerError>, JoinError>) {
        match result {
            Ok(Ok(state)) if !state.is_terminal() => {
                error!(?state, "Delivery finished in a non-terminal state");
                self.unsettled += 1;
            }
            Ok(Ok(MessageState::Acknowledged)) => self.acknowledged += 1,
            Ok(Ok(MessageState::Requeued)) => self.requeued += 1,
            Ok(Ok(_)) => self.dead_lettered += 1,
            Ok(Err(_)) => self.unsettled += 1,
            Err(e) => {
                error!("Delivery task failed: {}", e);
                self.unsettled += 1;
            }
        }
    }
}

/// Decodes deliveries, dispatches them through the [`Router`] and settles
/// each one exactly once on the [`DeliveryChannel`].
pub struct MessageConsumer {
    router: Router,
    channel: Arc<dyn DeliveryChannel>,
    policy: RedeliveryPolicy,
}

impl MessageConsumer {
    pub fn new(router: Router, channel: Arc<dyn DeliveryChannel>, policy: RedeliveryPolicy) -> Self {
        Self {
            router,
            channel,
            policy,
        }
    }

    /// Processes one delivery to settlement and returns its final state.
    /// Broker failures while settling are retried until they succeed.
    pub async fn process(&self, delivery: Delivery) -> Result<MessageState, BrokerError> {
        self.process_until(delivery, None).await
    }

    /// Like [`process`](Self::process), but gives up retrying a failed
    /// settlement once `shutdown` flips to true.
    async fn process_until(
        &self,
        mut delivery: Delivery,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<MessageState, BrokerError> {
        let span = info_span!(
            "delivery",
            tag = %delivery.tag,
            redelivery_count = delivery.redelivery_count,
            pattern = field::Empty,
            order_id = field::Empty,
            sku = field::Empty,
        );
        async move {
            debug!(state = ?MessageState::Received, "Delivery received");
            let disposition = self.dispatch(&mut delivery).await;
            self.settle(delivery, disposition, shutdown).await
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, delivery: &mut Delivery) -> Disposition {
        let envelope = match MessageEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Disposition::DeadLetter {
                    reason: format!("undecodable payload: {e}"),
                }
            }
        };
        Span::current().record("pattern", envelope.pattern.as_str());

        if let Some(reply_to) = delivery.reply_to.as_mut() {
            if reply_to.correlation_id.is_none() {
                reply_to.correlation_id = envelope.id.clone();
            }
        }

        let Some(handler) = self.router.handler(&envelope.pattern) else {
            return Disposition::DeadLetter {
                reason: format!("no handler for pattern {}", envelope.pattern),
            };
        };

        debug!(state = ?MessageState::Processing, "Dispatching to handler");
        match handler.handle(&envelope).await {
            Ok(Handled::Completed { reply }) => Disposition::Acknowledge { reply },
            Ok(Handled::Rejected { reason, reply }) => {
                info!(%reason, "Request rejected, acknowledging without retry");
                Disposition::Acknowledge { reply }
            }
            Err(HandlerError::Malformed(reason)) => Disposition::DeadLetter {
                reason: format!("malformed payload: {reason}"),
            },
            Err(HandlerError::Permanent(reason)) => Disposition::DeadLetter { reason },
            Err(HandlerError::Transient(reason)) => {
                warn!(%reason, "Transient failure while handling delivery");
                self.policy
                    .on_transient_failure(delivery.redelivery_count, &reason)
            }
        }
    }

    async fn settle(
        &self,
        delivery: Delivery,
        disposition: Disposition,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<MessageState, BrokerError> {
        // A reply that cannot be sent is a broker failure like any other.
        let disposition = match disposition {
            Disposition::Acknowledge { reply: Some(reply) } => match &delivery.reply_to {
                Some(to) => match self.channel.reply(to, &reply).await {
                    Ok(()) => Disposition::Acknowledge { reply: None },
                    Err(e) => {
                        warn!(error = %e, "Failed to send reply");
                        self.policy
                            .on_transient_failure(delivery.redelivery_count, &e.to_string())
                    }
                },
                None => Disposition::Acknowledge { reply: None },
            },
            other => other,
        };

        let state = disposition.state();
        match &disposition {
            Disposition::Acknowledge { .. } => {}
            Disposition::Requeue {
                redelivery_count,
                delay,
            } => {
                info!(
                    next_redelivery_count = *redelivery_count,
                    delay_ms = delay.as_millis() as u64,
                    "Requeueing delivery"
                );
                tokio::time::sleep(*delay).await;
            }
            Disposition::DeadLetter { reason } => error!(
                redelivery_count = delivery.redelivery_count,
                %reason,
                "Dead-lettering delivery"
            ),
        }

        let mut failures = 0;
        loop {
            let result = match &disposition {
                Disposition::Acknowledge { .. } => self.channel.ack(&delivery).await,
                Disposition::Requeue {
                    redelivery_count, ..
                } => self.channel.requeue(&delivery, *redelivery_count).await,
                Disposition::DeadLetter { reason } => {
                    self.channel.dead_letter(&delivery, reason).await
                }
            };

            let e = match result {
                Ok(()) => {
                    debug!(?state, "Delivery settled");
                    return Ok(state);
                }
                Err(e @ BrokerError::StaleTag { .. }) => {
                    error!(error = %e, ?state, "Delivery belongs to a closed session, it will be redelivered");
                    return Err(e);
                }
                Err(e) => e,
            };

            let delay = self.policy.backoff.delay_for_attempt(failures);
            failures += 1;
            warn!(
                error = %e,
                ?state,
                failures,
                delay_ms = delay.as_millis() as u64,
                "Failed to settle delivery, retrying"
            );
            if !wait_unless_shutdown(delay, shutdown.as_mut()).await {
                error!(error = %e, ?state, failures, "Shutting down with delivery unsettled, it will be redelivered");
                return Err(e);
            }
        }
    }

    /// Consumes `deliveries` with at most `max_in_flight` concurrently in
    /// progress until the stream ends or `shutdown` flips to true. In-flight
    /// deliveries are always brought to an end before this returns.
    pub async fn run<S>(
        self: Arc<Self>,
        deliveries: S,
        mut shutdown: watch::Receiver<bool>,
        max_in_flight: usize,
    ) -> RunSummary
    where
        S: Stream<Item = Delivery>,
    {
        let mut deliveries = std::pin::pin!(deliveries);
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut in_flight = JoinSet::new();
        let mut summary = RunSummary::default();

        info!(routes = ?self.router.patterns(), max_in_flight, "Message consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let consumer = Arc::clone(&self);
            let delivery_shutdown = shutdown.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                consumer
                    .process_until(delivery, Some(delivery_shutdown))
                    .await
            });

            while let Some(result) = in_flight.try_join_next() {
                summary.record(result);
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight deliveries to settle");
        }
        while let Some(result) = in_flight.join_next().await {
            summary.record(result);
        }

        info!(?summary, "Message consumer stopped");
        summary
    }
}

/// Sleeps for `delay`. Returns false without waiting it out when `shutdown`
/// is or becomes true.
async fn wait_unless_shutdown(
    delay: Duration,
    shutdown: Option<&mut watch::Receiver<bool>>,
) -> bool {
    let Some(shutdown) = shutdown else {
        tokio::time::sleep(delay).await;
        return true;
    };
    if *shutdown.borrow_and_update() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow_and_update() => return false,
                Ok(()) => {}
                // No one can signal shutdown any more.
                Err(_) => {
                    sleep.as_mut().await;
                    return true;
                }
            },
        }
    }
}
