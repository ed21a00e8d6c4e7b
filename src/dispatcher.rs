//! Process-wide service registry and session binding.
//!
//! The dispatcher owns the `service_id -> Service` registry shared by all
//! sessions it binds, and tracks live sessions by id. Credential policy
//! hooks in before [`Dispatcher::bind_wire`] hands a wire over; the
//! dispatcher itself only routes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::SessionError;
use crate::service::Service;
use crate::session::{CloseHook, ServiceMap, Session, SessionOptions};
use crate::wire::Wire;

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    services: ServiceMap,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                services: Arc::new(RwLock::new(HashMap::new())),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a service under its id. Fails on a duplicate id.
    pub fn register(
        &self,
        service_id: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> Result<(), SessionError> {
        let service_id = service_id.into();
        let mut services = self.inner.services.write();
        if services.contains_key(&service_id) {
            return Err(SessionError::ServiceAlreadyRegistered(service_id));
        }
        tracing::debug!(%service_id, "service registered");
        services.insert(service_id, service);
        Ok(())
    }

    /// Remove a service. Returns whether one was registered.
    pub fn unregister(&self, service_id: &str) -> bool {
        self.inner.services.write().remove(service_id).is_some()
    }

    pub fn service_count(&self) -> usize {
        self.inner.services.read().len()
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.inner.services.read().keys().cloned().collect()
    }

    /// Run the handshake on a freshly bound wire and install the resulting
    /// session. The session removes itself when it closes.
    pub async fn bind_wire(
        &self,
        wire: Wire,
        options: SessionOptions,
    ) -> Result<Session, SessionError> {
        let weak = Arc::downgrade(&self.inner);
        let hook: CloseHook = Box::new(move |session_id| {
            if let Some(inner) = weak.upgrade() {
                inner.sessions.lock().remove(&session_id);
            }
        });

        let session =
            Session::handshake(wire, self.inner.services.clone(), options, Some(hook)).await?;
        self.inner
            .sessions
            .lock()
            .insert(session.id(), session.clone());
        if session.is_closed() {
            // Lost the race against an immediate close; the hook already ran.
            self.inner.sessions.lock().remove(&session.id());
        }
        tracing::debug!(session_id = session.id(), "session installed");
        Ok(session)
    }

    pub fn session(&self, session_id: u64) -> Option<Session> {
        self.inner.sessions.lock().get(&session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("services", &self.service_count())
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Abort;
    use crate::service::CallContext;
    use crate::transport::Transport;
    use crate::wire::WireOptions;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use std::time::Duration;

    struct Echo;

    impl Service for Echo {
        fn invoke(&self, call: CallContext) -> BoxFuture<'static, Result<Bytes, Abort>> {
            Box::pin(async move { Ok(call.params().clone()) })
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("echo", Arc::new(Echo)).unwrap();
        assert!(matches!(
            dispatcher.register("echo", Arc::new(Echo)),
            Err(SessionError::ServiceAlreadyRegistered(_))
        ));
        assert_eq!(dispatcher.service_count(), 1);
    }

    #[test]
    fn unregister_frees_the_id() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("echo", Arc::new(Echo)).unwrap();
        assert!(dispatcher.unregister("echo"));
        assert!(!dispatcher.unregister("echo"));
        dispatcher.register("echo", Arc::new(Echo)).unwrap();
    }

    /// One dispatcher per peer, as in two separate processes.
    async fn bound_pair() -> (Dispatcher, Dispatcher, Session, Session) {
        let accepting = Dispatcher::new();
        let initiating = Dispatcher::new();
        accepting.register("echo", Arc::new(Echo)).unwrap();
        initiating.register("echo", Arc::new(Echo)).unwrap();

        let (ta, tb) = Transport::mem_pair();
        let wa = Wire::bind(ta, true, WireOptions::default());
        let wb = Wire::bind(tb, false, WireOptions::default());
        let (a, b) = tokio::join!(
            accepting.bind_wire(wa, SessionOptions::default()),
            initiating.bind_wire(wb, SessionOptions::default()),
        );
        (accepting, initiating, a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn bound_sessions_are_tracked_and_reaped() {
        let (accepting, initiating, a, _b) = bound_pair().await;
        assert_eq!(accepting.session_count(), 1);
        assert_eq!(initiating.session_count(), 1);
        assert!(accepting.session(a.id()).is_some());

        a.close(true).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while accepting.session_count() + initiating.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sessions were not reaped");
    }

    #[tokio::test]
    async fn calls_route_through_the_registry() {
        let (_accepting, _initiating, a, _b) = bound_pair().await;
        let call = a
            .open(0, "echo", 1, Bytes::from_static(b"ping"), false)
            .unwrap();
        assert_eq!(call.outcome().await.unwrap(), Bytes::from_static(b"ping"));
    }
}
