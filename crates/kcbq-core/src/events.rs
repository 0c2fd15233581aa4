//! Outbound notifications for external bookkeeping.
//!
//! Tasks write [`Event`]s into an unbounded channel through a [`Notifier`].
//! Sending never blocks and never fails the caller: a missing or closed
//! receiver just drops the event.

use tokio::sync::mpsc;

use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A source task read a row with this key.
    RecordObserved(String),
    /// A sink task accepted a row with this key.
    ModelUpsert(String),
    /// A sink task saw a delete (null value) for this key.
    ModelDelete(String),
    /// Answer to a stats report request.
    StatsReport { name: String, stats: StatsSnapshot },
}

impl Event {
    /// Wire name of the notification.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RecordObserved(_) => "record-observed",
            Event::ModelUpsert(_) => "model-upsert",
            Event::ModelDelete(_) => "model-delete",
            Event::StatsReport { .. } => "stats-report",
        }
    }
}

pub type EventRx = mpsc::UnboundedReceiver<Event>;

#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Notifier {
    /// Notifier plus the receiving end for the consumer.
    pub fn channel() -> (Self, EventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Notifier that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_the_receiver_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.emit(Event::ModelUpsert("1".into()));
        notifier.emit(Event::ModelDelete("2".into()));
        assert_eq!(rx.try_recv().unwrap(), Event::ModelUpsert("1".into()));
        assert_eq!(rx.try_recv().unwrap().kind(), "model-delete");
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.emit(Event::RecordObserved("1".into()));
        Notifier::disabled().emit(Event::RecordObserved("1".into()));
    }
}
