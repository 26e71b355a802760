//! Utilities for sharing a single CAN socket among tasks
//!
//! The physical channel is owned once; these wrappers let the daemon's bus
//! loop and responder (or any other tasks) each hold a sending handle and an
//! independent receive queue.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::{
    sync::mpsc::{channel, Receiver, Sender},
    task::JoinHandle,
};

use oxcan_common::{
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
    CanMessage,
};

/// A cloneable sending handle which serializes access to one sender
#[derive(Debug)]
pub struct SharedSender<S: AsyncCanSender> {
    inner: Arc<tokio::sync::Mutex<S>>,
}

impl<S: AsyncCanSender> Clone for SharedSender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncCanSender> SharedSender<S> {
    /// Wrap a sender for shared use
    pub fn new(sender: S) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(sender)),
        }
    }
}

impl<S: AsyncCanSender> AsyncCanSender for SharedSender<S> {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanSendError> {
        let mut inner = self.inner.lock().await;
        inner.send(msg).await
    }
}

/// Error returned when a shared receive channel is closed or empty
#[derive(Clone, Copy, Debug)]
pub struct NoMsgError;

impl core::fmt::Display for NoMsgError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "No message available")
    }
}

impl std::error::Error for NoMsgError {}

#[derive(Debug)]
struct SharedReceiverInner {
    senders: Vec<Sender<CanMessage>>,
}

impl SharedReceiverInner {
    fn create_rx(&mut self) -> Receiver<CanMessage> {
        let (tx, rx) = channel(100);
        self.senders.push(tx);
        rx
    }
}

/// Fans one CAN receiver out to any number of receive channels
///
/// A background task drains the underlying receiver and copies each message
/// to every live channel. Channels that fall behind drop messages.
#[derive(Debug)]
pub struct SharedReceiver {
    _task_handle: JoinHandle<()>,
    inner: Arc<Mutex<SharedReceiverInner>>,
}

impl SharedReceiver {
    /// Spawn the fan-out task over a receiver
    pub fn new<R: AsyncCanReceiver + 'static>(mut receiver: R) -> Self {
        let inner = Arc::new(Mutex::new(SharedReceiverInner {
            senders: Vec::new(),
        }));
        let inner_clone = inner.clone();
        let task_handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        let mut inner = inner_clone.lock().unwrap();
                        inner.senders.retain(|sender| match sender.try_send(msg) {
                            Ok(()) => true,
                            Err(TrySendError::Full(_)) => {
                                log::warn!("Dropped received message due to overflow");
                                true
                            }
                            Err(TrySendError::Closed(_)) => false,
                        });
                    }
                    Err(e) => {
                        log::error!("Error reading from CAN socket: {e}");
                    }
                }
            }
        });
        Self {
            _task_handle: task_handle,
            inner,
        }
    }

    /// Create a new receive channel fed by the fan-out task
    pub fn create_rx(&self) -> SharedReceiverChannel {
        let rx = self.inner.lock().unwrap().create_rx();

        SharedReceiverChannel {
            inner: self.inner.clone(),
            receiver: rx,
        }
    }

    /// Get the number of current receiver channels
    pub fn num_channels(&self) -> usize {
        self.inner.lock().unwrap().senders.len()
    }
}

impl Drop for SharedReceiver {
    fn drop(&mut self) {
        // The fan-out task owns the underlying receiver; stop it so the
        // socket is actually released when the bus is torn down
        self._task_handle.abort();
    }
}

/// One receive channel of a [`SharedReceiver`]
#[derive(Debug)]
pub struct SharedReceiverChannel {
    /// Data shared with the fan-out task
    inner: Arc<Mutex<SharedReceiverInner>>,
    /// Our receive channel
    receiver: Receiver<CanMessage>,
}

impl Clone for SharedReceiverChannel {
    fn clone(&self) -> Self {
        let receiver = self.inner.lock().unwrap().create_rx();
        Self {
            inner: self.inner.clone(),
            receiver,
        }
    }
}

impl AsyncCanReceiver for SharedReceiverChannel {
    type Error = NoMsgError;

    fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
        Ok(self.receiver.try_recv().ok())
    }

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.receiver.recv().await.ok_or(NoMsgError)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use oxcan_common::CanId;

    use super::*;

    struct MockReceiver {
        rx: Receiver<CanMessage>,
    }

    #[derive(Debug)]
    struct MockReceiveError {}

    impl core::fmt::Display for MockReceiveError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "mock receive error")
        }
    }
    impl std::error::Error for MockReceiveError {}

    impl AsyncCanReceiver for MockReceiver {
        type Error = MockReceiveError;

        fn try_recv(&mut self) -> Result<Option<CanMessage>, Self::Error> {
            Ok(self.rx.try_recv().ok())
        }

        async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
            self.rx.recv().await.ok_or(MockReceiveError {})
        }
    }

    #[tokio::test]
    async fn test_shared_receiver() {
        let (chan_tx, chan_rx) = channel(8);
        let shared_receiver = SharedReceiver::new(MockReceiver { rx: chan_rx });

        let mut channel_a = shared_receiver.create_rx();
        let mut channel_b = shared_receiver.create_rx();

        let msg100 = CanMessage::new(CanId::std(100), &[0, 1, 2, 3]);
        chan_tx.send(msg100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(Some(msg100), channel_a.try_recv().unwrap());
        assert_eq!(Some(msg100), channel_b.try_recv().unwrap());

        assert_eq!(None, channel_a.try_recv().unwrap());
        // Drop a channel, and make sure the channel count goes down after the
        // next message is processed
        drop(channel_a);

        chan_tx.send(msg100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(msg100, channel_b.recv().await.unwrap());

        assert_eq!(1, shared_receiver.num_channels());
    }
}
