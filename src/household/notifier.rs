//! Notifier: the single owner of the chat binding.
//!
//! Scheduler ticks and inbound messages arrive as [`Event`]s on one channel
//! and are handled one at a time, so the binding needs no lock. Sends are
//! spawned so a slow delivery never holds up the next event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::household::binding::{Action, ChatBinding};
use crate::household::composer::Composer;
use crate::household::schedule::{NotificationRule, Topic};
use crate::household::store::KeyValueStore;
use crate::household::transport::{Transport, TransportError, deliver};

/// Longest single sleep of a schedule task before it re-reads the clock.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A free-text message from a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub text: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A rule reached its due instant.
    Tick { topic: Topic, due: DateTime<Tz> },
    Inbound(InboundMessage),
}

/// Where scheduled notifications go.
#[derive(Debug, Clone, Copy)]
pub struct Routing {
    /// Fixed household chat. `None` means follow the chat binding.
    pub wg_chat_id: Option<i64>,
    /// Receives deployment-test notifications.
    pub dev_chat_id: i64,
}

pub type Delivery = JoinHandle<Result<(), TransportError>>;

fn fired_key(topic: Topic) -> String {
    format!("last_fired:{}", topic)
}

pub struct Notifier<T: Transport> {
    rules: HashMap<Topic, NotificationRule>,
    binding: ChatBinding,
    composer: Composer,
    transport: Arc<T>,
    store: Option<Arc<dyn KeyValueStore>>,
    routing: Routing,
    send_timeout: Duration,
}

impl<T: Transport> Notifier<T> {
    pub fn new(
        rules: Vec<NotificationRule>,
        binding: ChatBinding,
        composer: Composer,
        transport: Arc<T>,
        store: Option<Arc<dyn KeyValueStore>>,
        routing: Routing,
        send_timeout: Duration,
    ) -> Self {
        let rules = rules.into_iter().map(|r| (r.topic, r)).collect();
        Self { rules, binding, composer, transport, store, routing, send_timeout }
    }

    pub fn binding(&self) -> &ChatBinding {
        &self.binding
    }

    /// Chat that should receive `topic`, if any.
    pub fn destination(&self, topic: Topic) -> Option<i64> {
        match topic {
            Topic::DeploymentTest => Some(self.routing.dev_chat_id),
            _ => self.routing.wg_chat_id.or(self.binding.active_chat_id()),
        }
    }

    /// Process one event. Returns the spawned delivery, if a send was queued.
    pub fn handle(&mut self, event: Event) -> Option<Delivery> {
        match event {
            Event::Tick { topic, due } => self.on_tick(topic, due),
            Event::Inbound(msg) => self.on_inbound(msg),
        }
    }

    /// Consume events until every producer is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        info!("Notifier running with {} rule(s)", self.rules.len());
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        info!("Notifier stopped: all event sources closed");
    }

    fn on_tick(&self, topic: Topic, due: DateTime<Tz>) -> Option<Delivery> {
        let Some(rule) = self.rules.get(&topic) else {
            warn!("Tick for unknown topic {}", topic);
            return None;
        };
        if !rule.is_due(&due) {
            warn!("Tick for {} at {} but rule is not due, skipping", topic, due);
            return None;
        }

        let stamp = due.to_rfc3339();
        if self.already_fired(topic, &stamp) {
            info!("{} already fired at {}, skipping", topic, stamp);
            return None;
        }

        let Some(chat_id) = self.destination(topic) else {
            warn!("No chat bound, dropping {} notification", topic);
            return None;
        };

        info!("Firing {} reminder to chat {}", topic, chat_id);
        let message = self.composer.notification(&rule.body);
        let delivery = self.dispatch(chat_id, message.text());
        self.mark_fired(topic, &stamp);
        Some(delivery)
    }

    fn on_inbound(&mut self, msg: InboundMessage) -> Option<Delivery> {
        match self.binding.on_inbound(&msg.text, msg.chat_id, &self.composer) {
            Action::Rebind { chat_id, confirmation } => Some(self.dispatch(chat_id, confirmation.text())),
            Action::Respond(reply) => Some(self.dispatch(msg.chat_id, reply.text())),
            Action::Echo(text) => Some(self.dispatch(msg.chat_id, text)),
            Action::Ignore => None,
        }
    }

    fn dispatch(&self, chat_id: i64, text: String) -> Delivery {
        let transport = self.transport.clone();
        let timeout = self.send_timeout;
        tokio::spawn(async move { deliver(transport.as_ref(), chat_id, &text, timeout).await })
    }

    fn already_fired(&self, topic: Topic, stamp: &str) -> bool {
        let Some(ref store) = self.store else {
            return false;
        };
        match store.get(&fired_key(topic)) {
            Ok(last) => last.as_deref() == Some(stamp),
            Err(e) => {
                warn!("Could not read fire record for {}: {}", topic, e);
                false
            }
        }
    }

    fn mark_fired(&self, topic: Topic, stamp: &str) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.set(&fired_key(topic), stamp) {
                warn!("Could not record fire of {}: {}", topic, e);
            }
        }
    }
}

/// Spawn the timer for one rule. It posts a tick at every due instant
/// until the notifier side of the channel is dropped.
pub fn spawn_schedule(rule: NotificationRule, tz: Tz, tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let now = Utc::now().with_timezone(&tz);
        let Some(mut next) = rule.next_fire_after(&now) else {
            warn!("Rule {} never fires, not scheduling it", rule.topic);
            return;
        };
        info!("Scheduled {}: next at {}", rule.topic, next);

        loop {
            let now = Utc::now().with_timezone(&tz);
            if now < next {
                let wait = (next - now).to_std().unwrap_or_default().min(MAX_SLEEP);
                tokio::time::sleep(wait).await;
                continue;
            }

            debug!("{} due at {}", rule.topic, next);
            if tx.send(Event::Tick { topic: rule.topic, due: next }).await.is_err() {
                debug!("Notifier gone, stopping {} schedule", rule.topic);
                return;
            }

            match rule.next_fire_after(&next) {
                Some(after) => {
                    info!("Next {} at {}", rule.topic, after);
                    next = after;
                }
                None => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::household::binding::ControlPattern;
    use crate::household::schedule::{Schedule, household_rules};
    use crate::household::store::SqliteStore;
    use crate::household::transport::testing::RecordingTransport;
    use chrono::{TimeDelta, TimeZone};
    use chrono_tz::Europe::Zurich;

    const WG: i64 = -1001;
    const DEV: i64 = 7;

    fn notifier(
        wg_chat_id: Option<i64>,
        transport: Arc<RecordingTransport>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Notifier<RecordingTransport> {
        let mut rules = household_rules();
        rules.push(NotificationRule::new(
            Topic::DeploymentTest,
            Schedule::WeekdaysAt {
                days: vec![chrono::Weekday::Mon],
                time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            },
        ));
        Notifier::new(
            rules,
            ChatBinding::new(ControlPattern::new("bot", "identify", false).unwrap()),
            Composer::default(),
            transport,
            store,
            Routing { wg_chat_id, dev_chat_id: DEV },
            Duration::from_secs(1),
        )
    }

    fn trash_due() -> DateTime<Tz> {
        // Wednesday
        Zurich.with_ymd_and_hms(2024, 1, 3, 20, 45, 0).single().unwrap()
    }

    fn inbound(text: &str, chat_id: i64) -> Event {
        Event::Inbound(InboundMessage { text: text.to_string(), chat_id })
    }

    #[tokio::test]
    async fn test_tick_sends_to_fixed_chat() {
        let transport = Arc::new(RecordingTransport::default());
        let mut n = notifier(Some(WG), transport.clone(), None);

        let delivery = n.handle(Event::Tick { topic: Topic::Trash, due: trash_due() }).unwrap();
        delivery.await.unwrap().unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, WG);
        assert!(sent[0].1.contains("Morn isch Mülltag."));
    }

    #[tokio::test]
    async fn test_tick_without_binding_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let mut n = notifier(None, transport.clone(), None);
        assert!(n.handle(Event::Tick { topic: Topic::Trash, due: trash_due() }).is_none());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_tick_follows_binding() {
        let transport = Arc::new(RecordingTransport::default());
        let mut n = notifier(None, transport.clone(), None);

        n.handle(inbound("bot hi", 99)).unwrap().await.unwrap().unwrap();
        assert_eq!(n.binding().active_chat_id(), Some(99));

        n.handle(Event::Tick { topic: Topic::Trash, due: trash_due() })
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(chat, _)| *chat == 99));
    }

    #[tokio::test]
    async fn test_fixed_chat_wins_over_binding() {
        let transport = Arc::new(RecordingTransport::default());
        let mut n = notifier(Some(WG), transport.clone(), None);
        n.handle(inbound("bot hi", 99));
        assert_eq!(n.destination(Topic::Paper), Some(WG));
    }

    #[tokio::test]
    async fn test_deployment_test_goes_to_dev_chat() {
        let transport = Arc::new(RecordingTransport::default());
        let n = notifier(Some(WG), transport, None);
        assert_eq!(n.destination(Topic::DeploymentTest), Some(DEV));
    }

    #[tokio::test]
    async fn test_tick_not_due_is_skipped() {
        let transport = Arc::new(RecordingTransport::default());
        let mut n = notifier(Some(WG), transport.clone(), None);
        let wrong = trash_due() - TimeDelta::minutes(1);
        assert!(n.handle(Event::Tick { topic: Topic::Trash, due: wrong }).is_none());
    }

    #[tokio::test]
    async fn test_same_instant_fires_once() {
        let transport = Arc::new(RecordingTransport::default());
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let mut n = notifier(Some(WG), transport.clone(), Some(store.clone()));

        n.handle(Event::Tick { topic: Topic::Trash, due: trash_due() })
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        // A restarted notifier sharing the store skips the same instant
        let mut restarted = notifier(Some(WG), transport.clone(), Some(store));
        assert!(restarted.handle(Event::Tick { topic: Topic::Trash, due: trash_due() }).is_none());

        let next_week = trash_due() + TimeDelta::days(7);
        assert!(restarted.handle(Event::Tick { topic: Topic::Trash, due: next_week }).is_some());
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_stop_notifier() {
        let transport = Arc::new(RecordingTransport::failing());
        let mut n = notifier(Some(WG), transport.clone(), None);

        let result = n.handle(Event::Tick { topic: Topic::Trash, due: trash_due() }).unwrap().await.unwrap();
        assert!(result.is_err());

        let result = n.handle(inbound("hello", 5)).unwrap().await.unwrap();
        assert!(result.is_err());
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_echo_and_identify() {
        let transport = Arc::new(RecordingTransport::default());
        let mut n = notifier(Some(WG), transport.clone(), None);

        n.handle(inbound("hello", 5)).unwrap().await.unwrap().unwrap();
        n.handle(inbound("bot identify", 42)).unwrap().await.unwrap().unwrap();
        assert!(n.handle(inbound("", 5)).is_none());

        let sent = transport.sent();
        assert_eq!(sent[0], (5, "hello".to_string()));
        assert_eq!(sent[1].0, 42);
        assert!(sent[1].1.contains("42"));
    }

    #[tokio::test]
    async fn test_slow_send_does_not_block_next_event() {
        let transport = Arc::new(RecordingTransport {
            stall: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let mut n = notifier(Some(WG), transport.clone(), None);

        let started = std::time::Instant::now();
        let first = n.handle(inbound("one", 1)).unwrap();
        let second = n.handle(inbound("two", 2)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_schedule_posts_ticks() {
        let tz: Tz = Zurich;
        let anchor = (Utc::now() - TimeDelta::seconds(10)).with_timezone(&tz).naive_local();
        let rule = NotificationRule::new(
            Topic::DeploymentTest,
            Schedule::RepeatingInterval { period: TimeDelta::seconds(1), anchor },
        );

        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_schedule(rule, tz, tx);

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        match (first, second) {
            (Event::Tick { due: a, .. }, Event::Tick { due: b, .. }) => assert_eq!(b - a, TimeDelta::seconds(1)),
            other => panic!("expected ticks, got {:?}", other),
        }

        drop(rx);
        tokio::time::timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
    }
}
