//! Notification dispatch: resolves subscribers for newly opened offerings and
//! sends them one message per offering.

mod telegram;

pub use telegram::{TelegramConfig, TelegramNotifier};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{info, warn};

use crate::db::SubscriptionStore;
use crate::error::Result;
use crate::reconcile::Transition;
use crate::types::SubscriberId;

/// A command received from a subscriber, e.g. `/watch FGA0001`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub subscriber: SubscriberId,
    /// Command name without the leading slash, lower-cased.
    pub name: String,
    pub args: Vec<String>,
}

impl InboundCommand {
    /// Parses a chat message. Returns `None` for text that is not a command.
    ///
    /// Handles the `/cmd@botname` form used in group chats.
    pub fn parse(subscriber: SubscriberId, text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        if name.is_empty() {
            return None;
        }

        Some(Self {
            subscriber,
            name,
            args: parts.map(str::to_string).collect(),
        })
    }
}

/// Outbound messaging capability plus the inbound command stream.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `text` to one subscriber.
    async fn send(&self, subscriber: SubscriberId, text: &str) -> Result<()>;

    /// Infinite stream of subscriber commands. Ends only when the notifier
    /// shuts down.
    fn receive_commands(&self) -> BoxStream<'static, InboundCommand>;
}

/// Dispatch policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Drop a subscription once a notification for it was delivered.
    pub remove_after_notify: bool,
    pub max_concurrent_sends: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            remove_after_notify: false,
            max_concurrent_sends: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub removed: usize,
}

/// One pending message; owns its data so sends can run concurrently.
struct Delivery {
    subscriber: SubscriberId,
    subject_code: String,
    text: String,
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    subscriptions: Arc<SubscriptionStore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        subscriptions: Arc<SubscriptionStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            notifier,
            subscriptions,
            config,
        }
    }

    /// Sends one message per (subscriber, transitioned offering).
    ///
    /// Subscribers are resolved before any send, so no store lock is held
    /// while talking to the network. Delivery failures are logged and
    /// counted. Only a failure to resolve subscribers fails the call, and
    /// then nothing has been sent yet.
    pub async fn dispatch(&self, transitions: &[Transition]) -> Result<DispatchReport> {
        let mut seen: HashSet<(SubscriberId, i64)> = HashSet::new();
        let mut deliveries: Vec<Delivery> = Vec::new();

        for transition in transitions {
            let subscribers = self
                .subscriptions
                .list_by_subject(&transition.subject.code)?;
            for subscriber in subscribers {
                if seen.insert((subscriber, transition.offering_id)) {
                    deliveries.push(Delivery {
                        subscriber,
                        subject_code: transition.subject.code.clone(),
                        text: format_opening(transition),
                    });
                }
            }
        }

        let mut report = DispatchReport {
            attempted: deliveries.len(),
            ..Default::default()
        };
        if deliveries.is_empty() {
            return Ok(report);
        }

        let results: Vec<(Delivery, Result<()>)> = stream::iter(deliveries)
            .map(|delivery| {
                let notifier = Arc::clone(&self.notifier);
                async move {
                    let result = notifier.send(delivery.subscriber, &delivery.text).await;
                    (delivery, result)
                }
            })
            .buffer_unordered(self.config.max_concurrent_sends.max(1))
            .collect()
            .await;

        for (delivery, result) in results {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    if self.config.remove_after_notify {
                        match self
                            .subscriptions
                            .remove(delivery.subscriber, &delivery.subject_code)
                        {
                            Ok(true) => report.removed += 1,
                            Ok(false) => {}
                            Err(e) => warn!(
                                subscriber = delivery.subscriber,
                                subject = %delivery.subject_code,
                                error = %e,
                                "Failed to remove delivered subscription"
                            ),
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        subscriber = delivery.subscriber,
                        subject = %delivery.subject_code,
                        error = %e,
                        "Notification not delivered"
                    );
                }
            }
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            removed = report.removed,
            "Notifications dispatched"
        );

        Ok(report)
    }
}

/// Human-readable message for a newly opened offering.
pub fn format_opening(transition: &Transition) -> String {
    let o = &transition.offering;
    let seats = if transition.available_seats == 1 {
        "1 seat".to_string()
    } else {
        format!("{} seats", transition.available_seats)
    };

    format!(
        "Seats opened: {code} - {name}\n\
         Section: {section} ({term})\n\
         Instructor: {instructor}\n\
         Schedule: {schedule}\n\
         Location: {location}\n\
         Available: {seats} of {offered}",
        code = transition.subject.code,
        name = or_dash(&transition.subject.name),
        section = or_dash(&o.section_number),
        term = or_dash(&o.term_label),
        instructor = or_dash(&o.instructor),
        schedule = or_dash(&o.schedule),
        location = or_dash(&o.location),
        offered = o.offered_seats,
    )
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
