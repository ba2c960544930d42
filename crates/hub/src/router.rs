//! Topic demultiplexer: many in-process handlers share one broker
//! subscription per topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broker::BrokerConnection;

pub type Handler = Arc<dyn Fn(&str, &[u8]) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct TopicRouter {
    broker: BrokerConnection,
    routes: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl TopicRouter {
    pub fn new(broker: BrokerConnection) -> Self {
        Self {
            broker,
            routes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a handler for `topic`. The first handler for a topic subscribes it
    /// on the broker.
    pub async fn register<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut routes = self.routes.lock();
            let handlers = routes.entry(topic.to_string()).or_default();
            handlers.push((id, Arc::new(handler)));
            handlers.len() == 1
        };

        if first {
            if let Err(e) = self.broker.subscribe(topic).await {
                // The topic stays in the broker's set and is restored on the
                // next reconnect.
                warn!(%topic, error = %e, "subscribe failed");
            }
        }
        debug!(%topic, handler = id.0, "handler registered");
        id
    }

    /// Remove a handler. Returns `false` if it was not registered. Removing
    /// the last handler for a topic unsubscribes it.
    pub async fn unregister(&self, topic: &str, id: HandlerId) -> bool {
        let last = {
            let mut routes = self.routes.lock();
            let Some(handlers) = routes.get_mut(topic) else {
                return false;
            };
            let before = handlers.len();
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.len() == before {
                return false;
            }
            if handlers.is_empty() {
                routes.remove(topic);
                true
            } else {
                false
            }
        };

        if last {
            if let Err(e) = self.broker.unsubscribe(topic).await {
                warn!(%topic, error = %e, "unsubscribe failed");
            }
        }
        debug!(%topic, handler = id.0, "handler unregistered");
        true
    }

    /// Run every handler registered for `topic`, in registration order.
    /// Handler errors are logged and do not stop the remaining handlers.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        // Snapshot so handlers may (un)register without holding the lock.
        let handlers: Vec<Handler> = {
            let routes = self.routes.lock();
            match routes.get(topic) {
                Some(hs) => hs.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            debug!(%topic, "no handlers for topic");
            return 0;
        }

        for handler in &handlers {
            if let Err(e) = handler(topic, payload) {
                warn!(
                    %topic,
                    payload = %String::from_utf8_lossy(payload),
                    "handler rejected message: {e:#}"
                );
            }
        }
        handlers.len()
    }

    #[cfg(test)]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    #[cfg(test)]
    pub fn handler_count(&self, topic: &str) -> usize {
        self.routes.lock().get(topic).map_or(0, Vec::len)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{recording_connection, Call};
    use anyhow::bail;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |name: &'static str| -> Handler {
            let log = Arc::clone(&log2);
            Arc::new(move |_t: &str, _p: &[u8]| {
                log.lock().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[tokio::test]
    async fn fan_out_in_registration_order() {
        let (conn, _client) = recording_connection();
        let router = TopicRouter::new(conn);
        let (log, make) = recorder();

        let h1 = make("h1");
        let h2 = make("h2");
        router.register("env/sensor", move |t, p| h1(t, p)).await;
        router.register("env/sensor", move |t, p| h2(t, p)).await;

        assert_eq!(router.dispatch("env/sensor", b"x"), 2);
        assert_eq!(*log.lock(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let (conn, _client) = recording_connection();
        let router = TopicRouter::new(conn);
        let (log, make) = recorder();

        router
            .register("env/sensor", |_t, _p| bail!("boom"))
            .await;
        let h2 = make("h2");
        router.register("env/sensor", move |t, p| h2(t, p)).await;

        assert_eq!(router.dispatch("env/sensor", b"x"), 2);
        assert_eq!(*log.lock(), vec!["h2"]);
    }

    #[tokio::test]
    async fn broker_subscribed_once_per_topic() {
        let (conn, client) = recording_connection();
        conn.on_connected().await;
        let router = TopicRouter::new(conn);

        router.register("chart/1", |_t, _p| Ok(())).await;
        router.register("chart/1", |_t, _p| Ok(())).await;

        assert_eq!(client.calls(), vec![Call::Subscribe("chart/1".into())]);
        assert_eq!(router.handler_count("chart/1"), 2);
    }

    #[tokio::test]
    async fn last_unregister_unsubscribes() {
        let (conn, client) = recording_connection();
        conn.on_connected().await;
        let router = TopicRouter::new(conn);

        let a = router.register("chart/1", |_t, _p| Ok(())).await;
        let b = router.register("chart/1", |_t, _p| Ok(())).await;
        client.clear();

        assert!(router.unregister("chart/1", a).await);
        assert!(client.calls().is_empty());

        assert!(router.unregister("chart/1", b).await);
        assert_eq!(client.calls(), vec![Call::Unsubscribe("chart/1".into())]);
        assert!(router.topics().is_empty());
    }

    #[tokio::test]
    async fn unregister_unknown_handler_returns_false() {
        let (conn, _client) = recording_connection();
        let router = TopicRouter::new(conn);
        let id = router.register("a", |_t, _p| Ok(())).await;

        assert!(!router.unregister("b", id).await);
        assert!(router.unregister("a", id).await);
        assert!(!router.unregister("a", id).await);
    }

    #[tokio::test]
    async fn dispatch_unknown_topic_invokes_nothing() {
        let (conn, _client) = recording_connection();
        let router = TopicRouter::new(conn);
        assert_eq!(router.dispatch("nobody/listens", b"1"), 0);
    }

    #[tokio::test]
    async fn unregistered_handler_not_invoked() {
        let (conn, _client) = recording_connection();
        let router = TopicRouter::new(conn);
        let (log, make) = recorder();

        let h1 = make("h1");
        let h2 = make("h2");
        let id1 = router.register("t", move |t, p| h1(t, p)).await;
        router.register("t", move |t, p| h2(t, p)).await;
        router.unregister("t", id1).await;

        router.dispatch("t", b"");
        assert_eq!(*log.lock(), vec!["h2"]);
    }
}
