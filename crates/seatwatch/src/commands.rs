//! Subscriber-facing chat commands.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::{DbOffering, OfferingRow, OfferingStore, OfferingView, SubscriptionStore};
use crate::error::{Error, Result};
use crate::notify::{InboundCommand, Notifier};
use crate::types::{SubscriberId, WatchCode};

/// Maximum offerings listed in one `/available` or `/search` reply.
const MAX_LISTED: usize = 20;

const USAGE: &str = "I watch the SIGAA class listing and tell you when a seat opens.\n\
    /watch CODE - get notified when CODE has free seats (e.g. /watch FGA0001)\n\
    /unwatch CODE - stop watching CODE\n\
    /list - subjects you are watching\n\
    /search CODE - current sections of CODE\n\
    /available [availability|occupied|offered] - sections with free seats";

pub struct CommandSurface {
    notifier: Arc<dyn Notifier>,
    offerings: Arc<OfferingStore>,
    subscriptions: Arc<SubscriptionStore>,
}

impl CommandSurface {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        offerings: Arc<OfferingStore>,
        subscriptions: Arc<SubscriptionStore>,
    ) -> Self {
        Self {
            notifier,
            offerings,
            subscriptions,
        }
    }

    /// Answers commands until `cancel` fires or the command stream ends.
    pub async fn run(self, cancel: CancellationToken) {
        let mut commands = self.notifier.receive_commands();
        info!("Command surface started");

        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                next = commands.next() => match next {
                    Some(command) => command,
                    None => break,
                },
            };

            let reply = self.handle(&command);
            if let Err(e) = self.notifier.send(command.subscriber, &reply).await {
                warn!(
                    subscriber = command.subscriber,
                    command = %command.name,
                    error = %e,
                    "Reply not delivered"
                );
            }
        }

        info!("Command surface stopped");
    }

    /// Executes one command and renders the reply text.
    pub fn handle(&self, command: &InboundCommand) -> String {
        let arg = command.args.first().map(String::as_str).unwrap_or("");
        let result = match command.name.as_str() {
            "start" | "help" => Ok(USAGE.to_string()),
            "watch" | "warn" => self.watch(command.subscriber, arg),
            "unwatch" => self.unwatch(command.subscriber, arg),
            "list" => self.list(command.subscriber),
            "search" => self.search(arg),
            "available" => self.available(arg),
            other => Ok(format!("Unknown command /{other}.\n\n{USAGE}")),
        };

        match result {
            Ok(reply) => reply,
            Err(Error::ValidationError { input, message }) => {
                if input.trim().is_empty() {
                    format!("Missing argument: {message}")
                } else {
                    format!("\"{input}\" is not valid: {message}")
                }
            }
            Err(e) => {
                error!(
                    subscriber = command.subscriber,
                    command = %command.name,
                    error = %e,
                    "Command failed"
                );
                "Something went wrong on my side, please try again later.".to_string()
            }
        }
    }

    fn watch(&self, subscriber: SubscriberId, arg: &str) -> Result<String> {
        let code = WatchCode::parse(arg)?;
        let added = self.subscriptions.add_subscription(subscriber, code.as_str())?;
        info!(subscriber, code = %code, added, "Watch requested");

        let offerings = self.offerings.query_by_code(code.as_str())?;
        let open: u32 = offerings.iter().map(|o| o.available_seats).sum();

        let mut reply = if added {
            String::new()
        } else {
            format!("You were already watching {code}. ")
        };
        if offerings.is_empty() {
            let _ = write!(
                reply,
                "{code} is not in the class listing yet. I'll watch it anyway and tell you when seats open."
            );
        } else if open == 0 {
            let name = &offerings[0].subject.name;
            let _ = write!(
                reply,
                "{code} - {name} is full right now. I'll tell you as soon as a seat opens."
            );
        } else {
            let name = &offerings[0].subject.name;
            let _ = write!(
                reply,
                "{code} - {name} has {open} open seat(s) right now, see /search {code}. \
                 I'll also tell you about new openings."
            );
        }
        Ok(reply)
    }

    fn unwatch(&self, subscriber: SubscriberId, arg: &str) -> Result<String> {
        let code = WatchCode::parse(arg)?;
        if self.subscriptions.remove(subscriber, code.as_str())? {
            Ok(format!("Stopped watching {code}."))
        } else {
            Ok(format!("You were not watching {code}."))
        }
    }

    fn list(&self, subscriber: SubscriberId) -> Result<String> {
        let codes = self.subscriptions.list_for_subscriber(subscriber)?;
        if codes.is_empty() {
            return Ok("You are not watching anything. Try /watch FGA0001.".to_string());
        }
        Ok(format!("You are watching: {}", codes.join(", ")))
    }

    fn search(&self, arg: &str) -> Result<String> {
        let code = WatchCode::parse(arg)?;
        let offerings = self.offerings.query_by_code(code.as_str())?;
        if offerings.is_empty() {
            return Ok(format!("{code} is not in the class listing."));
        }

        let header = format!("{code} - {}", offerings[0].subject.name);
        Ok(render_listing(&header, &offerings, OfferingView::Full))
    }

    fn available(&self, arg: &str) -> Result<String> {
        let view = OfferingView::from_str(arg)?;
        let offerings = self.offerings.query_by_availability(1)?;
        if offerings.is_empty() {
            return Ok("No section has free seats right now.".to_string());
        }
        Ok(render_listing("Sections with free seats:", &offerings, view))
    }
}

fn render_listing(header: &str, offerings: &[DbOffering], view: OfferingView) -> String {
    let mut out = header.to_string();
    for offering in offerings.iter().take(MAX_LISTED) {
        out.push('\n');
        out.push_str(&render_row(&offering.project(view)));
    }
    if offerings.len() > MAX_LISTED {
        let _ = write!(out, "\n... and {} more", offerings.len() - MAX_LISTED);
    }
    out
}

fn render_row(row: &OfferingRow) -> String {
    let mut line = format!("{} T{} {} {}", row.code, row.section, row.instructor, row.schedule);
    if let Some(available) = row.available {
        let _ = write!(line, " | free {available}");
    }
    if let Some(occupied) = row.occupied {
        let _ = write!(line, " | taken {occupied}");
    }
    if let Some(offered) = row.offered {
        let _ = write!(line, " | offered {offered}");
    }
    line
}
