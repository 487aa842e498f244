//! One-shot notification, used to ask long-lived loops to shut down.

use std::{future::Future, io, pin::Pin, task};

use tokio::sync::oneshot::{self, error::TryRecvError, Receiver, Sender};

pub struct OneshotTx(Sender<()>);

impl OneshotTx {
    pub fn notify(self) -> io::Result<()> {
        self.0.send(()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionReset,
                "failed to send notification across oneshot channel",
            )
        })
    }
}

pub struct OneshotRx {
    rx: Receiver<()>,
    fired: bool,
}

impl Future for OneshotRx {
    type Output = ();

    /// Resolves once notified. A dropped sender counts as a notification, since nobody is left
    /// to keep the receiving side alive.
    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<()> {
        if self.fired {
            return task::Poll::Ready(());
        }
        match Pin::new(&mut self.rx).poll(cx) {
            task::Poll::Ready(_) => {
                self.fired = true;
                task::Poll::Ready(())
            }
            task::Poll::Pending => task::Poll::Pending,
        }
    }
}

impl OneshotRx {
    /// Checks, without waiting, whether a notification has arrived.
    pub fn is_notified(&mut self) -> bool {
        if self.fired {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => {
                self.fired = true;
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }
}

pub fn make_pair() -> (OneshotTx, OneshotRx) {
    let (tx, rx) = oneshot::channel();
    (OneshotTx(tx), OneshotRx { rx, fired: false })
}

#[cfg(test)]
mod test {
    use super::make_pair;

    #[tokio::test]
    async fn send_recv() {
        let (tx, mut rx) = make_pair();
        assert!(!rx.is_notified());
        assert!(tx.notify().is_ok());
        assert!(rx.is_notified());
        // Already fired; stays fired.
        (&mut rx).await;
        assert!(rx.is_notified());
    }

    #[tokio::test]
    async fn dropped_sender_notifies() {
        let (tx, rx) = make_pair();
        drop(tx);
        rx.await;
    }
}
