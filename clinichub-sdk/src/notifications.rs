//! Payment notifications: a tenant-wide broadcast on its own hub channel.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::EventChannel;
use crate::error::Result;
use crate::event::{events, HubEvent, PaymentEvent};
use crate::subscription::{GroupMembership, SubscriptionManager};

pub type PaymentCallback = Arc<dyn Fn(&PaymentEvent) + Send + Sync>;

/// Forwards `PaymentUpdated` pushes for one tenant to a callback.
#[derive(Clone)]
pub struct PaymentNotifications {
    channel: EventChannel,
    subscriptions: SubscriptionManager,
    tenant: Arc<Mutex<Option<String>>>,
    callback: Arc<Mutex<Option<PaymentCallback>>>,
}

impl PaymentNotifications {
    pub fn new(channel: EventChannel) -> Self {
        let callback: Arc<Mutex<Option<PaymentCallback>>> = Arc::new(Mutex::new(None));
        let sink = callback.clone();
        channel.on(events::PAYMENT_UPDATED, move |args| {
            let payment = match HubEvent::parse(events::PAYMENT_UPDATED, &args) {
                Ok(HubEvent::PaymentUpdated(payment)) => payment,
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable payment event");
                    return;
                }
            };
            tracing::debug!(payment_id = payment.payment_id, status = %payment.status, "payment event");
            let callback = sink.lock().clone();
            if let Some(callback) = callback {
                callback(&payment);
            }
        });

        Self {
            subscriptions: SubscriptionManager::new(channel.clone()),
            channel,
            tenant: Arc::new(Mutex::new(None)),
            callback,
        }
    }

    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub fn on_payment<F>(&self, f: F)
    where
        F: Fn(&PaymentEvent) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(f));
    }

    /// Current tenant, if any.
    pub fn tenant(&self) -> Option<String> {
        self.tenant.lock().clone()
    }

    /// Receive broadcasts for `tenant_id`, leaving the previous tenant's group.
    pub async fn watch_tenant(&self, tenant_id: &str) -> Result<()> {
        let previous = self.tenant.lock().replace(tenant_id.to_string());
        if let Some(previous) = previous.filter(|p| p != tenant_id) {
            self.subscriptions.leave(&GroupMembership::tenant(previous)).await?;
        }
        self.subscriptions.join(GroupMembership::tenant(tenant_id)).await
    }

    pub async fn close(&self) {
        self.channel.off(events::PAYMENT_UPDATED);
        self.tenant.lock().take();
        self.channel.disconnect().await;
    }
}
