use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Ended,
}

/// Sending half of the process-wide "session ended" notification.
#[derive(Debug, Clone)]
pub struct SessionSignal {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Receiving half. Not `Clone`: exactly one listener tears the session down.
#[derive(Debug)]
pub struct SessionSignalReceiver {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

pub fn session_signal() -> (SessionSignal, SessionSignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SessionSignal { tx }, SessionSignalReceiver { rx })
}

impl SessionSignal {
    pub fn session_ended(&self) {
        if self.tx.send(SessionEvent::Ended).is_err() {
            tracing::debug!("session ended with no listener attached");
        }
    }
}

impl SessionSignalReceiver {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}
