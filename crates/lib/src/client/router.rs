//! Message router: every inbound frame either completes a pending call or becomes a push.

use super::events::PushMessage;
use super::pending::PendingTable;
use crate::protocol::{Decoded, ResponseFrame};
use tokio::sync::broadcast;

/// What the router did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Resolved(String),
    Rejected(String),
    /// Response for an id that is no longer pending (timed out or duplicate); dropped.
    Late(String),
    Pushed,
}

pub struct MessageRouter {
    pushes: broadcast::Sender<PushMessage>,
}

impl MessageRouter {
    pub fn new(pushes: broadcast::Sender<PushMessage>) -> Self {
        Self { pushes }
    }

    pub fn dispatch_text(&self, text: &str, pending: &mut PendingTable) -> Route {
        match ResponseFrame::decode(text) {
            Decoded::Response(frame) => self.dispatch(frame, pending),
            Decoded::Malformed(raw) => {
                log::warn!("forwarding undecodable frame as raw push ({} bytes)", raw.len());
                self.push(PushMessage::Raw(raw))
            }
        }
    }

    /// Binary frames carry the same envelope as text when they are valid UTF-8.
    pub fn dispatch_binary(&self, data: Vec<u8>, pending: &mut PendingTable) -> Route {
        match String::from_utf8(data) {
            Ok(text) => self.dispatch_text(&text, pending),
            Err(e) => {
                log::warn!("forwarding non-utf8 binary frame as raw push");
                self.push(PushMessage::Raw(
                    String::from_utf8_lossy(e.as_bytes()).into_owned(),
                ))
            }
        }
    }

    pub fn dispatch(&self, frame: ResponseFrame, pending: &mut PendingTable) -> Route {
        let Some(request_id) = frame.request_id else {
            return self.push(PushMessage::Frame {
                typ: frame.typ,
                payload: frame.payload,
            });
        };
        let (completed, route) = match frame.error {
            Some(error) => (
                pending.reject(&request_id, error),
                Route::Rejected(request_id.clone()),
            ),
            None => (
                pending.resolve(&request_id, frame.payload),
                Route::Resolved(request_id.clone()),
            ),
        };
        if completed {
            route
        } else {
            Route::Late(request_id)
        }
    }

    fn push(&self, message: PushMessage) -> Route {
        if self.pushes.send(message).is_err() {
            log::debug!("push dropped: no subscribers");
        }
        Route::Pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use tokio::sync::{mpsc, oneshot};

    fn setup() -> (MessageRouter, broadcast::Receiver<PushMessage>, PendingTable) {
        let (push_tx, push_rx) = broadcast::channel(16);
        let (expire_tx, _) = mpsc::unbounded_channel();
        (MessageRouter::new(push_tx), push_rx, PendingTable::new(expire_tx))
    }

    #[tokio::test]
    async fn matching_response_resolves_call() {
        let (router, mut pushes, mut pending) = setup();
        let (tx, rx) = oneshot::channel();
        let id = pending.register("chat", Box::new(tx), None);

        let text = ResponseFrame::ok(&id, "message", Some("hello".into())).encode();
        assert_eq!(router.dispatch_text(&text, &mut pending), Route::Resolved(id));
        assert_eq!(rx.await.unwrap(), Ok(Some("hello".to_string())));
        assert!(pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_response_rejects_call() {
        let (router, _pushes, mut pending) = setup();
        let (tx, rx) = oneshot::channel();
        let id = pending.register("command", Box::new(tx), None);

        let text = ResponseFrame::err(&id, "error", "unknown command").encode();
        assert_eq!(router.dispatch_text(&text, &mut pending), Route::Rejected(id));
        assert_eq!(
            rx.await.unwrap(),
            Err(CallError::ServerError("unknown command".into()))
        );
    }

    #[tokio::test]
    async fn null_request_id_is_pushed() {
        let (router, mut pushes, mut pending) = setup();
        let text = r#"{"requestId":null,"type":"event","payload":"update","error":null}"#;
        assert_eq!(router.dispatch_text(text, &mut pending), Route::Pushed);
        assert_eq!(
            pushes.try_recv().unwrap(),
            PushMessage::Frame {
                typ: "event".into(),
                payload: Some("update".into())
            }
        );
    }

    #[tokio::test]
    async fn unknown_request_id_is_dropped() {
        let (router, mut pushes, mut pending) = setup();
        let text = ResponseFrame::ok("gone", "message", Some("late".into())).encode();
        assert_eq!(
            router.dispatch_text(&text, &mut pending),
            Route::Late("gone".into())
        );
        assert!(pushes.try_recv().is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_pass_through_raw() {
        let (router, mut pushes, mut pending) = setup();
        assert_eq!(router.dispatch_text("<<garbage>>", &mut pending), Route::Pushed);
        assert_eq!(pushes.try_recv().unwrap(), PushMessage::Raw("<<garbage>>".into()));

        router.dispatch_binary(vec![0xff, 0xfe], &mut pending);
        assert!(matches!(pushes.try_recv().unwrap(), PushMessage::Raw(_)));
    }
}
