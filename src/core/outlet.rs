use crate::core::queue::{queue, Capacity, QueueReceiver, QueueSender};
use crate::core::stage::{lock, panic_message, Emitter, StageCore};
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus};
use crate::domain::ports::{Link, Target};
use crate::utils::error::PipelineError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// 輸出佇列中的項目
pub(crate) enum Item<T> {
    Message(Envelope<T>),
    /// 已被消化、沒有產生輸出的輸入
    Settled(Vec<Claim>),
}

/// worker 端的輸出
pub(crate) struct Publisher<T> {
    tx: Option<QueueSender<Item<T>>>,
}

impl<T: Send + 'static> Publisher<T> {
    /// 沒有輸出的 stage（sink）使用
    pub(crate) fn discard() -> Self {
        Self { tx: None }
    }

    pub(crate) fn has_output(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) async fn publish(&self, out: Emitter<T>) {
        let Some(tx) = &self.tx else { return };
        for item in out.into_items() {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    }
}

/// stage 的輸出端。多個連結或接收者競爭同一個佇列，每則訊息只交給一方
pub(crate) struct Outlet<T> {
    core: Arc<StageCore>,
    rx: tokio::sync::Mutex<QueueReceiver<Item<T>>>,
    stash: Mutex<VecDeque<Envelope<T>>>,
    reserved: Mutex<Option<Envelope<T>>>,
}

pub(crate) fn outlet<T: Send + 'static>(
    core: Arc<StageCore>,
    capacity: Capacity,
) -> (Publisher<T>, Arc<Outlet<T>>) {
    let (tx, rx) = queue(capacity);
    let outlet = Outlet {
        core,
        rx: tokio::sync::Mutex::new(rx),
        stash: Mutex::new(VecDeque::new()),
        reserved: Mutex::new(None),
    };
    (Publisher { tx: Some(tx) }, Arc::new(outlet))
}

impl<T: Send + 'static> Outlet<T> {
    async fn next_item(&self) -> Option<Item<T>> {
        if let Some(message) = lock(&self.stash).pop_front() {
            return Some(Item::Message(message));
        }
        let mut rx = self.rx.lock().await;
        if self.core.is_faulted() {
            return None;
        }
        match rx.recv().await {
            // 故障後不再交出任何訊息
            Some(_) if self.core.is_faulted() => None,
            Some(item) => Some(item),
            None => {
                self.core.drained();
                None
            }
        }
    }

    pub(crate) async fn receive(&self) -> Option<Envelope<T>> {
        loop {
            match self.next_item().await? {
                Item::Message(message) => return Some(message),
                Item::Settled(_) => continue,
            }
        }
    }

    pub(crate) fn link_to(self: &Arc<Self>, target: Arc<dyn Target<T>>, options: LinkOptions) -> Link {
        tracing::trace!("🔗 Linked '{}' -> '{}'", self.core.label(), target.label());
        let outlet = Arc::clone(self);
        let downstream = target.clone();
        let task = tokio::spawn(async move { outlet.forward(target, options).await });
        let abort = task.abort_handle();

        // offer 內的 panic（例如計時回呼）讓下游進入故障
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    let error = PipelineError::StageAborted {
                        stage: downstream.label().to_string(),
                        message: panic_message(e),
                    };
                    downstream.fault(error);
                }
            }
        });
        Link::new(move || abort.abort())
    }

    async fn forward(&self, target: Arc<dyn Target<T>>, options: LinkOptions) {
        while let Some(item) = self.next_item().await {
            match item {
                Item::Message(message) => match target.offer(message).await {
                    OfferStatus::Accepted => {}
                    OfferStatus::Declined(message) | OfferStatus::Postponed(message) => {
                        tracing::debug!(
                            "↩️ '{}' declined a message from '{}', dropping the link",
                            target.label(),
                            self.core.label()
                        );
                        lock(&self.stash).push_front(message);
                        return;
                    }
                },
                Item::Settled(claims) => target.settle(claims).await,
            }
        }

        if options.propagate_completion {
            match self.core.outcome() {
                Some(Err(error)) => target.fault(error),
                _ => target.complete(),
            }
        }
    }

    pub(crate) async fn reserve(&self) -> Option<MessageId> {
        if lock(&self.reserved).is_some() {
            return None;
        }
        let message = self.receive().await?;
        let id = message.id();
        let mut slot = lock(&self.reserved);
        if slot.is_some() {
            drop(slot);
            lock(&self.stash).push_front(message);
            return None;
        }
        *slot = Some(message);
        Some(id)
    }

    fn take_reserved(&self, id: MessageId) -> Option<Envelope<T>> {
        let mut slot = lock(&self.reserved);
        match slot.as_ref() {
            Some(message) if message.id() == id => slot.take(),
            _ => None,
        }
    }

    pub(crate) fn consume(&self, id: MessageId) -> Option<Envelope<T>> {
        self.take_reserved(id)
    }

    pub(crate) fn release(&self, id: MessageId) -> bool {
        match self.take_reserved(id) {
            Some(message) => {
                lock(&self.stash).push_front(message);
                true
            }
            None => false,
        }
    }
}
