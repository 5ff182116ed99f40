//! In-process hub used by tests and demos.
//!
//! `MemoryHub` plays the server side: it counts handshakes, records every
//! invocation, can be told to refuse handshakes or fail, slow down or stall
//! specific calls, and can push events or drop the current link to simulate
//! network loss.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{HubConnector, HubInvoker, HubLink, Inbound};
use crate::error::{HubError, Result};

/// A recorded remote-procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub procedure: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct HubState {
    handshakes: u32,
    refuse_next: u32,
    handshake_delay: Duration,
    last_credential: Option<String>,
    invocations: Vec<Invocation>,
    // (procedure, first argument) pairs that answer with an error
    failing: HashSet<(String, String)>,
    // (procedure, first argument) pairs that never answer
    stalled: HashSet<(String, String)>,
    invocation_delay: HashMap<String, Duration>,
    next_link: u64,
    current: Option<(u64, mpsc::Sender<Inbound>)>,
}

/// Fake hub endpoint. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { hub: self.clone() }
    }

    /// Refuse the next `n` handshakes.
    pub fn refuse_next_handshakes(&self, n: u32) {
        self.state.lock().refuse_next = n;
    }

    /// Make every handshake take `delay` before completing.
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.state.lock().handshake_delay = delay;
    }

    /// Answer calls to `procedure` whose first argument is `first_arg` with an error.
    pub fn fail_invocation(&self, procedure: &str, first_arg: &Value) {
        self.state
            .lock()
            .failing
            .insert((procedure.to_string(), first_arg.to_string()));
    }

    /// Never answer calls to `procedure` whose first argument is `first_arg`.
    /// The call is still recorded.
    pub fn stall_invocation(&self, procedure: &str, first_arg: &Value) {
        self.state
            .lock()
            .stalled
            .insert((procedure.to_string(), first_arg.to_string()));
    }

    /// Answer every call to `procedure` only after `delay`. The call is
    /// recorded when it arrives.
    pub fn set_invocation_delay(&self, procedure: &str, delay: Duration) {
        self.state
            .lock()
            .invocation_delay
            .insert(procedure.to_string(), delay);
    }

    pub fn handshakes(&self) -> u32 {
        self.state.lock().handshakes
    }

    pub fn last_credential(&self) -> Option<String> {
        self.state.lock().last_credential.clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    /// Arguments of every recorded call to `procedure`, in call order.
    pub fn calls_to(&self, procedure: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|i| i.procedure == procedure)
            .map(|i| i.args.clone())
            .collect()
    }

    pub fn clear_invocations(&self) {
        self.state.lock().invocations.clear();
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// Push an event over the current link. Returns false when nobody is connected.
    pub async fn push(&self, name: &str, args: Vec<Value>) -> bool {
        let tx = self.state.lock().current.as_ref().map(|(_, tx)| tx.clone());
        let Some(tx) = tx else {
            return false;
        };
        tx.send(Inbound::Event {
            name: name.to_string(),
            args,
        })
        .await
        .is_ok()
    }

    /// Simulate a network drop of the current link.
    pub fn drop_link(&self, reason: &str) {
        if let Some((_, tx)) = self.state.lock().current.take() {
            let _ = tx.try_send(Inbound::Closed {
                reason: reason.to_string(),
            });
        }
    }

    fn close_link(&self, id: u64) {
        let mut state = self.state.lock();
        if state.current.as_ref().is_some_and(|(cur, _)| *cur == id) {
            state.current = None;
        }
    }

    fn link_open(&self, id: u64) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(|(cur, _)| *cur == id)
    }
}

/// [`HubConnector`] for a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryConnector {
    hub: MemoryHub,
}

impl HubConnector for MemoryConnector {
    fn open(&self, credential: String) -> BoxFuture<'static, Result<HubLink>> {
        let hub = self.hub.clone();
        async move {
            let delay = {
                let mut state = hub.state.lock();
                state.handshakes += 1;
                state.last_credential = Some(credential);
                state.handshake_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = hub.state.lock();
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(HubError::Handshake("connection refused".to_string()));
            }
            state.next_link += 1;
            let id = state.next_link;
            let (tx, rx) = mpsc::channel(64);
            state.current = Some((id, tx));
            drop(state);

            Ok(HubLink {
                invoker: Arc::new(MemoryInvoker { hub: hub.clone(), id }),
                inbound: rx,
            })
        }
        .boxed()
    }
}

struct MemoryInvoker {
    hub: MemoryHub,
    id: u64,
}

impl HubInvoker for MemoryInvoker {
    fn invoke(&self, procedure: String, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let hub = self.hub.clone();
        let id = self.id;
        async move {
            if !hub.link_open(id) {
                return Err(HubError::Transport("link closed".to_string()));
            }
            let (fails, stalls, delay) = {
                let mut state = hub.state.lock();
                let key = (procedure.clone(), args.first().map(Value::to_string).unwrap_or_default());
                let fails = state.failing.contains(&key);
                let stalls = state.stalled.contains(&key);
                let delay = state.invocation_delay.get(&procedure).copied();
                state.invocations.push(Invocation {
                    procedure: procedure.clone(),
                    args,
                });
                (fails, stalls, delay)
            };
            if stalls {
                return std::future::pending::<Result<Value>>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fails {
                return Err(HubError::Remote {
                    procedure,
                    message: "rejected by hub".to_string(),
                });
            }
            Ok(Value::Null)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let hub = self.hub.clone();
        let id = self.id;
        async move { hub.close_link(id) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_invocations_and_pushes_events() {
        let hub = MemoryHub::new();
        let mut link = hub.connector().open("tok".into()).await.unwrap();
        assert_eq!(hub.handshakes(), 1);
        assert_eq!(hub.last_credential().as_deref(), Some("tok"));

        link.invoker.invoke("JoinGroup".into(), vec![json!("a")]).await.unwrap();
        assert_eq!(hub.calls_to("JoinGroup"), vec![vec![json!("a")]]);

        assert!(hub.push("Ping", vec![json!(1)]).await);
        assert_eq!(
            link.inbound.recv().await,
            Some(Inbound::Event { name: "Ping".into(), args: vec![json!(1)] })
        );
    }

    #[tokio::test]
    async fn refused_handshake_and_failing_call() {
        let hub = MemoryHub::new();
        hub.refuse_next_handshakes(1);
        assert!(hub.connector().open(String::new()).await.is_err());

        let link = hub.connector().open(String::new()).await.unwrap();
        hub.fail_invocation("JoinGroup", &json!("bad"));
        assert!(link.invoker.invoke("JoinGroup".into(), vec![json!("bad")]).await.is_err());
        assert!(link.invoker.invoke("JoinGroup".into(), vec![json!("good")]).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_link_reports_closed_and_rejects_calls() {
        let hub = MemoryHub::new();
        let mut link = hub.connector().open(String::new()).await.unwrap();
        hub.drop_link("network down");
        assert!(matches!(link.inbound.recv().await, Some(Inbound::Closed { .. })));
        assert_eq!(link.inbound.recv().await, None);
        assert!(link.invoker.invoke("X".into(), vec![]).await.is_err());
        assert!(!hub.is_linked());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_and_delayed_calls_are_recorded_on_arrival() {
        let hub = MemoryHub::new();
        let link = hub.connector().open(String::new()).await.unwrap();
        hub.stall_invocation("JoinGroup", &json!("slow"));
        hub.set_invocation_delay("LeaveGroup", Duration::from_secs(1));

        let stalled = link.invoker.invoke("JoinGroup".into(), vec![json!("slow")]);
        assert!(tokio::time::timeout(Duration::from_secs(60), stalled).await.is_err());

        let started = tokio::time::Instant::now();
        link.invoker.invoke("LeaveGroup".into(), vec![json!("a")]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(hub.calls_to("JoinGroup"), vec![vec![json!("slow")]]);
    }
}
