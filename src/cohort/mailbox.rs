use tokio::{
    io::AsyncRead,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, Instrument};

use crate::{
    net::{wire::Directive, LinkRx},
    Error, Result,
};

/// Single-slot mailbox for directives issued by the client.
///
/// A reader task keeps exactly one receive outstanding on the client's
/// stream. When a directive arrives it parks it in the slot and waits until
/// the control loop takes it before reading the next one. `poll` never
/// blocks, so the tick cadence is independent of the client.
pub struct Mailbox {
    slot: mpsc::Receiver<Result<Directive>>,
    reader: JoinHandle<()>,
}

impl Mailbox {
    pub fn spawn<R>(mut rx: LinkRx<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, slot) = mpsc::channel(1);
        let reader = tokio::spawn(
            async move {
                loop {
                    let received = rx.recv_directive().await;
                    let last = !matches!(
                        received,
                        Ok(Directive::Continue) | Ok(Directive::Snapshot)
                    );
                    if tx.send(received).await.is_err() || last {
                        break;
                    }
                }
                debug!("client control channel done");
            }
            .in_current_span(),
        );
        Self { slot, reader }
    }

    /// Takes the pending directive, if any. A reader that ended without
    /// delivering `STOP` reports a protocol error so the caller halts.
    pub fn poll(&mut self) -> Option<Result<Directive>> {
        match self.slot.try_recv() {
            Ok(received) => Some(received),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::protocol(
                "client control channel closed without STOP",
            ))),
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
