use tokio::sync::watch;

/// Held by whoever may stop a poll loop.
#[derive(Debug)]
pub(crate) struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Held by the poll loop; resolves once the handle fires or is dropped.
#[derive(Debug, Clone)]
pub(crate) struct CancelSignal {
    rx: watch::Receiver<bool>,
}

pub(crate) fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub(crate) fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub(crate) async fn cancelled(&mut self) {
        // An Err means the handle is gone, which also ends the loop.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}
