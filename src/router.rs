use std::sync::Arc;

use dashmap::DashMap;
use graph_types::Location;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::RuntimeError;
use crate::message::Message;

/// What an extension task receives on its queue.
#[derive(Debug)]
pub(crate) enum ThreadMsg {
    Msg(Message),
    /// Message injected from outside the graph; the outcome of dispatching
    /// it is reported back.
    Client {
        msg: Message,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Close(oneshot::Sender<()>),
}

/// Queues of every running extension (and the engine), keyed by location.
#[derive(Clone, Default, Debug)]
pub struct MsgRouter {
    queues: Arc<DashMap<Location, mpsc::UnboundedSender<ThreadMsg>>>,
}

impl MsgRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, loc: Location) -> mpsc::UnboundedReceiver<ThreadMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(loc, tx);
        rx
    }

    pub(crate) fn unregister(&self, loc: &Location) {
        self.queues.remove(loc);
    }

    pub fn is_registered(&self, loc: &Location) -> bool {
        self.queues.contains_key(loc)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub(crate) fn send(&self, loc: &Location, tmsg: ThreadMsg) -> Result<(), ThreadMsg> {
        match self.queues.get(loc) {
            Some(tx) => tx.send(tmsg).map_err(|e| e.0),
            None => Err(tmsg),
        }
    }

    /// Hand `msg` to the queue of its first destination. The message comes
    /// back when nobody listens there.
    pub(crate) fn deliver(&self, msg: Message) -> Result<(), Message> {
        let Some(dest) = msg.dest_locs().first().cloned() else {
            return Err(msg);
        };
        trace!(dest = %dest, msg_type = %msg.msg_type(), name = msg.name(), "deliver");
        let Some(tx) = self.queues.get(&dest) else {
            return Err(msg);
        };
        if let Err(mpsc::error::SendError(ThreadMsg::Msg(msg))) = tx.send(ThreadMsg::Msg(msg)) {
            return Err(msg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_registered_queue() {
        let router = MsgRouter::new();
        let loc = Location::new("app", "g", "grp", "f");
        let mut rx = router.register(loc.clone());

        let mut data = Message::new_data("frame");
        data.set_dest(loc.clone());
        router.deliver(data).unwrap();
        match rx.recv().await {
            Some(ThreadMsg::Msg(m)) => assert_eq!(m.name(), "frame"),
            other => panic!("unexpected {other:?}"),
        }

        router.unregister(&loc);
        let mut again = Message::new_data("frame");
        again.set_dest(loc);
        assert!(router.deliver(again).is_err());
        assert!(router.is_empty());
    }

    #[test]
    fn message_without_dest_is_returned() {
        let router = MsgRouter::new();
        assert!(router.deliver(Message::new_data("x")).is_err());
    }
}
