//! Message correlator: routes published messages to waiting subscriptions
//! keyed on `(messageName, correlationKey)`.
//!
//! Publish-before-subscribe buffers the message with a TTL; a later
//! matching subscription consumes it. Each message is consumed at most
//! once; when several subscriptions match, the oldest wins.

use crate::store::ProcessStore;
use crate::types::{BufferedMessage, Subscription, SubscriptionStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A subscription/message pair that matched; the scheduler turns this into
/// a token resume.
#[derive(Clone, Debug)]
pub struct CorrelatedDelivery {
    pub subscription: Subscription,
    pub message: BufferedMessage,
}

pub struct MessageCorrelator {
    store: Arc<dyn ProcessStore>,
}

impl MessageCorrelator {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self { store }
    }

    /// Register a subscription. If an unexpired buffered message already
    /// matches, it is consumed atomically and returned for delivery.
    pub async fn subscribe(
        &self,
        mut subscription: Subscription,
        now: DateTime<Utc>,
    ) -> Result<Option<CorrelatedDelivery>> {
        let buffered = self
            .store
            .find_buffered_messages(&subscription.message_name, &subscription.correlation_key)
            .await?;

        if let Some(mut message) = buffered.into_iter().find(|m| !m.expired_at(now)) {
            message.consumed_by = Some(subscription.subscription_id);
            subscription.status = SubscriptionStatus::Matched;
            self.store.save_message(&message).await?;
            self.store.save_subscription(&subscription).await?;
            info!(
                name = %message.name,
                correlation_key = %message.correlation_key,
                "correlator: subscription matched buffered message"
            );
            return Ok(Some(CorrelatedDelivery {
                subscription,
                message,
            }));
        }

        subscription.status = SubscriptionStatus::Pending;
        self.store.save_subscription(&subscription).await?;
        debug!(
            name = %subscription.message_name,
            correlation_key = %subscription.correlation_key,
            "correlator: subscription pending"
        );
        Ok(None)
    }

    /// Publish a message. The oldest pending matching subscription consumes
    /// it immediately; otherwise the message is buffered until its TTL.
    pub async fn publish(
        &self,
        mut message: BufferedMessage,
    ) -> Result<Option<CorrelatedDelivery>> {
        let pending = self
            .store
            .find_pending_subscriptions(&message.name, &message.correlation_key)
            .await?;

        if let Some(mut subscription) = pending.into_iter().next() {
            subscription.status = SubscriptionStatus::Matched;
            message.consumed_by = Some(subscription.subscription_id);
            self.store.save_subscription(&subscription).await?;
            self.store.save_message(&message).await?;
            info!(
                name = %message.name,
                correlation_key = %message.correlation_key,
                token_id = %subscription.token_id,
                "correlator: message matched pending subscription"
            );
            return Ok(Some(CorrelatedDelivery {
                subscription,
                message,
            }));
        }

        self.store.save_message(&message).await?;
        debug!(
            name = %message.name,
            correlation_key = %message.correlation_key,
            ttl_seconds = message.ttl_seconds,
            "correlator: message buffered"
        );
        Ok(None)
    }

    pub async fn cancel_subscription(&self, subscription_id: Uuid) -> Result<()> {
        if let Some(mut sub) = self.store.load_subscription(subscription_id).await? {
            if sub.status == SubscriptionStatus::Pending {
                sub.status = SubscriptionStatus::Cancelled;
                self.store.save_subscription(&sub).await?;
            }
        }
        Ok(())
    }

    pub async fn cancel_for_instance(&self, instance_id: Uuid) -> Result<()> {
        for mut sub in self.store.load_subscriptions_by_instance(instance_id).await? {
            if sub.status == SubscriptionStatus::Pending {
                sub.status = SubscriptionStatus::Cancelled;
                self.store.save_subscription(&sub).await?;
            }
        }
        Ok(())
    }

    /// Drop expired buffered messages.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.purge_expired_messages(now).await
    }
}
