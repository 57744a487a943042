use std::sync::Arc;

use crate::broker::message::Attributes;
use crate::broker::subscription::Subscription;
use crate::consumer::Consumer;
use crate::dlq::DeadLetterChannel;

/// A subscription wired to its consumer endpoint and dead-letter channel.
#[derive(Debug, Clone)]
pub struct SubscriptionBinding {
    pub subscription: Subscription,
    pub consumer: Arc<Consumer>,
    pub dlq: DeadLetterChannel,
}

/// A named topic and the subscriptions attached to it.
///
/// Subscriptions are registered at configuration time; the broker fans each
/// published message out to every binding whose filter policy matches.
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscriptions: Vec<Arc<SubscriptionBinding>>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: Vec::new(),
        }
    }

    pub fn add(&mut self, binding: Arc<SubscriptionBinding>) {
        self.subscriptions.push(binding);
    }

    /// Bindings whose filter policy accepts the given attributes.
    ///
    /// Filtering happens here, once per message per subscription; a message
    /// that does not match never enters that subscription's delivery state
    /// machine.
    pub fn matching(&self, attributes: &Attributes) -> Vec<Arc<SubscriptionBinding>> {
        self.subscriptions
            .iter()
            .filter(|binding| binding.subscription.filter_policy.matches(attributes))
            .cloned()
            .collect()
    }
}
