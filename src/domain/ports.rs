use crate::core::completion::Completion;
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus};
use crate::utils::error::PipelineError;
use async_trait::async_trait;
use std::sync::Arc;

/// 所有 stage 共有的能力：名稱與完成狀態
pub trait Stage: Send + Sync {
    fn label(&self) -> &str;

    /// 當此 stage 及其輸出都處理完畢時完成
    fn completion(&self) -> Completion;
}

/// 輸入端能力
#[async_trait]
pub trait Target<T: Send + 'static>: Stage {
    /// 送入一則訊息；佇列已滿時會暫停呼叫端直到有空間
    async fn offer(&self, message: Envelope<T>) -> OfferStatus<T>;

    /// 不等待的版本；佇列已滿時回傳 `Postponed`
    fn try_offer(&self, message: Envelope<T>) -> OfferStatus<T>;

    /// 上游消化了這些輸入卻沒有產生輸出；與訊息依序往下游傳遞
    async fn settle(&self, _claims: Vec<Claim>) {}

    fn complete(&self);

    fn fault(&self, error: PipelineError);
}

/// 輸出端能力
#[async_trait]
pub trait Source<T: Send + 'static>: Stage {
    fn link_to(&self, target: Arc<dyn Target<T>>, options: LinkOptions) -> Link;

    /// 拉取下一則訊息；輸出結束後回傳 `None`
    async fn receive(&self) -> Option<Envelope<T>>;

    /// 保留下一則訊息，之後以 `consume` 取走或以 `release` 歸還
    async fn reserve(&self) -> Option<MessageId>;

    fn consume(&self, id: MessageId) -> Option<Envelope<T>>;

    fn release(&self, id: MessageId) -> bool;
}

/// 同時具備輸入與輸出的 stage
pub trait Propagator<I: Send + 'static, O: Send + 'static>: Target<I> + Source<O> {}

impl<I, O, S> Propagator<I, O> for S
where
    I: Send + 'static,
    O: Send + 'static,
    S: Target<I> + Source<O> + ?Sized,
{
}

/// `link_to` 建立的連結；`unlink` 之後不再轉送，也不傳遞完成
pub struct Link {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Link {
    pub(crate) fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unlink(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

impl<S: Stage + ?Sized> Stage for Arc<S> {
    fn label(&self) -> &str {
        (**self).label()
    }

    fn completion(&self) -> Completion {
        (**self).completion()
    }
}

#[async_trait]
impl<T: Send + 'static, S: Target<T> + ?Sized> Target<T> for Arc<S> {
    async fn offer(&self, message: Envelope<T>) -> OfferStatus<T> {
        (**self).offer(message).await
    }

    fn try_offer(&self, message: Envelope<T>) -> OfferStatus<T> {
        (**self).try_offer(message)
    }

    async fn settle(&self, claims: Vec<Claim>) {
        (**self).settle(claims).await
    }

    fn complete(&self) {
        (**self).complete()
    }

    fn fault(&self, error: PipelineError) {
        (**self).fault(error)
    }
}

#[async_trait]
impl<T: Send + 'static, S: Source<T> + ?Sized> Source<T> for Arc<S> {
    fn link_to(&self, target: Arc<dyn Target<T>>, options: LinkOptions) -> Link {
        (**self).link_to(target, options)
    }

    async fn receive(&self) -> Option<Envelope<T>> {
        (**self).receive().await
    }

    async fn reserve(&self) -> Option<MessageId> {
        (**self).reserve().await
    }

    fn consume(&self, id: MessageId) -> Option<Envelope<T>> {
        (**self).consume(id)
    }

    fn release(&self, id: MessageId) -> bool {
        (**self).release(id)
    }
}
