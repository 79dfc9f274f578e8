//! Pending request table: correlates responses to the calls waiting on them.
//!
//! Every registered call leaves the table exactly once, through `resolve`, `reject`,
//! `expire`, or `fail_all`. Whichever happens first removes the entry; later attempts find
//! nothing and do nothing. Deadline timers are spawned tasks that report the id back on
//! `expire_tx`; resolving a call aborts its timer.

use crate::error::CallError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Outcome delivered to a caller: the response payload (possibly null) or why there is none.
pub type CallResult = Result<Option<String>, CallError>;

/// Receives the single outcome of a call.
pub trait Completion: Send {
    fn complete(self: Box<Self>, outcome: CallResult);
}

impl Completion for oneshot::Sender<CallResult> {
    fn complete(self: Box<Self>, outcome: CallResult) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = (*self).send(outcome);
    }
}

/// One in-flight request.
pub struct PendingCall {
    pub id: String,
    pub typ: String,
    pub created_at: DateTime<Utc>,
    /// None for calls registered without a deadline.
    pub deadline: Option<Instant>,
    completion: Box<dyn Completion>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn finish(self, outcome: CallResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.completion.complete(outcome);
    }
}

/// Outstanding calls keyed by request id.
pub struct PendingTable {
    calls: HashMap<String, PendingCall>,
    expire_tx: mpsc::UnboundedSender<String>,
}

impl PendingTable {
    /// `expire_tx` receives the id of each call whose deadline passes.
    pub fn new(expire_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            calls: HashMap::new(),
            expire_tx,
        }
    }

    /// A request id not used by any outstanding call.
    pub fn fresh_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !self.calls.contains_key(&id) {
                return id;
            }
        }
    }

    /// Store a call under a fresh id and arm its deadline. Returns the id to put on the wire.
    pub fn register(
        &mut self,
        typ: &str,
        completion: Box<dyn Completion>,
        timeout: Option<Duration>,
    ) -> String {
        let id = self.fresh_id();
        let deadline = timeout.map(|after| Instant::now() + after);
        let timer = timeout.map(|after| {
            let expire_tx = self.expire_tx.clone();
            let expired_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = expire_tx.send(expired_id);
            })
            .abort_handle()
        });
        self.calls.insert(
            id.clone(),
            PendingCall {
                id: id.clone(),
                typ: typ.to_string(),
                created_at: Utc::now(),
                deadline,
                completion,
                timer,
            },
        );
        log::debug!("registered {} call {} ({} pending)", typ, id, self.calls.len());
        id
    }

    /// Complete a call with its response payload. False when no such call is pending.
    pub fn resolve(&mut self, request_id: &str, payload: Option<String>) -> bool {
        self.finish(request_id, Ok(payload))
    }

    /// Complete a call with a server-reported error. False when no such call is pending.
    pub fn reject(&mut self, request_id: &str, message: impl Into<String>) -> bool {
        self.finish(request_id, Err(CallError::ServerError(message.into())))
    }

    /// Deadline passed. No-op when the call already completed, has no deadline, or its deadline
    /// is still ahead.
    pub fn expire(&mut self, request_id: &str) -> bool {
        match self.calls.get(request_id) {
            None => return false,
            Some(call) if call.deadline.map_or(true, |d| Instant::now() < d) => {
                log::debug!("ignoring early expiry for call {}", request_id);
                return false;
            }
            Some(_) => {}
        }
        let Some(call) = self.calls.remove(request_id) else {
            return false;
        };
        let waited = Utc::now() - call.created_at;
        log::debug!(
            "{} call {} timed out after {}ms",
            call.typ,
            call.id,
            waited.num_milliseconds()
        );
        call.finish(Err(CallError::RequestTimeout));
        true
    }

    /// Complete every pending call with `reason` and clear the table. Returns how many failed.
    pub fn fail_all(&mut self, reason: CallError) -> usize {
        let drained: Vec<PendingCall> = self.calls.drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            call.finish(Err(reason.clone()));
        }
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.calls.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn finish(&mut self, request_id: &str, outcome: CallResult) -> bool {
        match self.calls.remove(request_id) {
            Some(call) => {
                call.finish(outcome);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records every outcome it is handed, to prove single delivery.
    struct Recorder(Arc<Mutex<Vec<CallResult>>>);

    impl Completion for Recorder {
        fn complete(self: Box<Self>, outcome: CallResult) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    fn table() -> (PendingTable, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PendingTable::new(tx), rx)
    }

    fn recorder() -> (Box<Recorder>, Arc<Mutex<Vec<CallResult>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Box::new(Recorder(seen.clone())), seen)
    }

    #[tokio::test]
    async fn ids_are_unique_among_outstanding_calls() {
        let (mut table, _rx) = table();
        let mut ids = HashSet::new();
        for _ in 0..200 {
            let (done, _) = recorder();
            assert!(ids.insert(table.register("chat", done, None)));
        }
        assert_eq!(table.len(), 200);
    }

    #[tokio::test]
    async fn resolve_completes_once() {
        let (mut table, _rx) = table();
        let (done, seen) = recorder();
        let id = table.register("chat", done, None);

        assert!(table.resolve(&id, Some("hello".into())));
        assert!(!table.resolve(&id, Some("again".into())));
        assert!(!table.reject(&id, "late"));
        assert!(!table.expire(&id));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Ok(Some("hello".to_string()))]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_leave_table_unchanged() {
        let (mut table, _rx) = table();
        let (done, seen) = recorder();
        let id = table.register("chat", done, None);

        assert!(!table.resolve("nope", Some("x".into())));
        assert!(!table.reject("nope", "x"));
        assert!(!table.expire("nope"));
        assert!(table.contains(&id));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_reports_server_error() {
        let (mut table, _rx) = table();
        let (tx, rx) = oneshot::channel();
        let id = table.register("command", Box::new(tx), None);
        assert!(table.reject(&id, "boom"));
        assert_eq!(rx.await.unwrap(), Err(CallError::ServerError("boom".into())));
    }

    #[tokio::test]
    async fn fail_all_clears_and_completes_everything() {
        let (mut table, _rx) = table();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        table.register("chat", a, Some(Duration::from_secs(120)));
        table.register("chat", b, None);

        assert_eq!(table.fail_all(CallError::ConnectionClosed), 2);
        assert!(table.is_empty());
        assert_eq!(seen_a.lock().unwrap().as_slice(), &[Err(CallError::ConnectionClosed)]);
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[Err(CallError::ConnectionClosed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_expiry() {
        let (mut table, mut rx) = table();
        let (tx, done) = oneshot::channel();
        let id = table.register("chat", Box::new(tx), Some(Duration::from_secs(5)));

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired, id);
        assert!(table.expire(&expired));
        assert_eq!(done.await.unwrap(), Err(CallError::RequestTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_before_deadline_is_ignored() {
        let (mut table, _rx) = table();
        let (done, seen) = recorder();
        let id = table.register("chat", done, Some(Duration::from_secs(5)));
        let (open, _) = recorder();
        let open_id = table.register("chat", open, None);

        assert!(!table.expire(&id));
        assert!(!table.expire(&open_id));
        assert!(table.contains(&id));
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(table.expire(&id));
        assert!(table.contains(&open_id));
        assert_eq!(seen.lock().unwrap().as_slice(), &[Err(CallError::RequestTimeout)]);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_cancels_deadline() {
        let (mut table, mut rx) = table();
        let (done, seen) = recorder();
        let id = table.register("chat", done, Some(Duration::from_secs(5)));
        assert!(table.resolve(&id, None));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(seen.lock().unwrap().as_slice(), &[Ok(None)]);
    }
}
