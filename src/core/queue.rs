use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 佇列容量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    #[default]
    Unbounded,
    Bounded(usize),
}

pub(crate) enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
        }
    }
}

pub(crate) enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> QueueSender<T> {
    /// 佇列已關閉時把值交還
    pub(crate) async fn send(&self, value: T) -> Result<(), T> {
        match self {
            Self::Bounded(tx) => tx.send(value).await.map_err(|e| e.0),
            Self::Unbounded(tx) => tx.send(value).map_err(|e| e.0),
        }
    }

    pub(crate) fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        match self {
            Self::Bounded(tx) => tx.try_send(value).map_err(|e| match e {
                mpsc::error::TrySendError::Full(v) => TrySendError::Full(v),
                mpsc::error::TrySendError::Closed(v) => TrySendError::Closed(v),
            }),
            Self::Unbounded(tx) => tx.send(value).map_err(|e| TrySendError::Closed(e.0)),
        }
    }
}

pub(crate) enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueReceiver<T> {
    pub(crate) async fn recv(&mut self) -> Option<T> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

pub(crate) fn queue<T>(capacity: Capacity) -> (QueueSender<T>, QueueReceiver<T>) {
    match capacity {
        Capacity::Bounded(size) => {
            let (tx, rx) = mpsc::channel(size.max(1));
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        Capacity::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_queue_reports_full() {
        let (tx, mut rx) = queue::<u32>(Capacity::Bounded(1));
        assert!(tx.try_send(1).is_ok());
        assert!(matches!(tx.try_send(2), Err(TrySendError::Full(2))));
        assert_eq!(rx.recv().await, Some(1));

        drop(rx);
        assert!(matches!(tx.try_send(3), Err(TrySendError::Closed(3))));
    }

    #[test]
    fn test_capacity_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            capacity: Capacity,
        }

        let bounded: Wrapper = toml::from_str("capacity = { bounded = 8 }").unwrap();
        assert_eq!(bounded.capacity, Capacity::Bounded(8));

        let unbounded: Wrapper = toml::from_str("capacity = \"unbounded\"").unwrap();
        assert_eq!(unbounded.capacity, Capacity::Unbounded);
    }
}
