//! Server-sent event stream over one subscription.

use super::registry::Subscription;
use axum::response::sse::Event;
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Subscribed; nothing written yet.
    Registering,
    Active,
    /// Disconnected; queued deltas are being discarded.
    Draining,
    Closed,
}

struct Pump {
    subscription: Option<Subscription>,
    state: StreamState,
    heartbeat: Duration,
}

enum Next {
    Delta(Option<super::Delta>),
    Idle,
}

impl Pump {
    fn new(subscription: Subscription, heartbeat: Duration) -> Self {
        Pump {
            subscription: Some(subscription),
            state: StreamState::Registering,
            heartbeat,
        }
    }

    async fn next_event(&mut self) -> Option<Event> {
        match self.state {
            StreamState::Registering => {
                self.state = StreamState::Active;
                Some(heartbeat())
            }
            StreamState::Active => {
                let next = {
                    let subscription = self.subscription.as_mut()?;
                    tokio::select! {
                        delta = subscription.recv() => Next::Delta(delta),
                        _ = tokio::time::sleep(self.heartbeat) => Next::Idle,
                    }
                };
                match next {
                    Next::Idle => Some(heartbeat()),
                    Next::Delta(None) => {
                        self.close();
                        None
                    }
                    Next::Delta(Some(delta)) => match Event::default().event("change").json_data(&delta) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            tracing::warn!(error = %e, "could not encode change event");
                            self.close();
                            None
                        }
                    },
                }
            }
            StreamState::Draining | StreamState::Closed => None,
        }
    }

    fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = StreamState::Draining;
        if let Some(mut subscription) = self.subscription.take() {
            let discarded = subscription.drain();
            tracing::debug!(id = subscription.id(), discarded, "stream closed");
        }
        self.state = StreamState::Closed;
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.close();
    }
}

fn heartbeat() -> Event {
    Event::default().event("heartbeat").data("")
}

/// Events for `subscription`: a heartbeat on open, `change` per delivered delta, and a
/// heartbeat after each idle `interval`. Dropping the stream unsubscribes.
pub fn change_stream(
    subscription: Subscription,
    interval: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(Pump::new(subscription, interval), |mut pump| async move {
        let event = pump.next_event().await?;
        Some((Ok(event), pump))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::{resolve, CatalogConfig};
    use crate::notifier::{ChangeEvent, Notifier};
    use crate::query::Filter;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    fn fixture() -> (Arc<Catalog>, Arc<Notifier>) {
        let config: CatalogConfig = serde_json::from_value(json!({
            "tables": [{
                "name": "bonuses",
                "columns": [{ "key": "id", "type": "serial", "primary_key": true }]
            }]
        }))
        .unwrap();
        let catalog = Arc::new(resolve(&config).unwrap());
        (catalog.clone(), Arc::new(Notifier::new(catalog)))
    }

    #[tokio::test]
    async fn dropping_the_stream_unsubscribes() {
        let (catalog, notifier) = fixture();
        let table = catalog.resolve("bonuses").unwrap();
        let subscription = notifier.subscribe(table, Filter::default()).unwrap();
        let mut events = Box::pin(change_stream(subscription, Duration::from_secs(60)));
        assert!(events.next().await.is_some());
        assert_eq!(notifier.stats().subscribers, 1);
        drop(events);
        assert_eq!(notifier.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn idle_streams_emit_heartbeats_between_changes() {
        let (catalog, notifier) = fixture();
        let table = catalog.resolve("bonuses").unwrap();
        let subscription = notifier.subscribe(table, Filter::default()).unwrap();
        let mut events = Box::pin(change_stream(subscription, Duration::from_millis(20)));
        events.next().await.unwrap().unwrap();
        events.next().await.unwrap().unwrap();
        let row = json!({"id": 7}).as_object().cloned().unwrap();
        notifier.dispatch("bonuses", &[ChangeEvent::insert("bonuses", row)]);
        let next = tokio::time::timeout(Duration::from_secs(1), events.next()).await.unwrap();
        assert!(next.is_some());
    }
}
