use crate::core::completion::Completion;
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus};
use crate::domain::ports::{Link, Source, Stage, Target};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 組裝完成的 pipeline。輸入轉給第一個 stage，輸出與完成狀態來自最後一個 stage
///
/// 本身不擁有任何 stage；丟棄 handle 不影響已經在執行的 stage。
pub struct PipelineHandle<I, O> {
    head: Arc<dyn Target<I>>,
    tail: Arc<dyn Source<O>>,
    next_id: Arc<AtomicU64>,
}

impl<I, O> Clone for PipelineHandle<I, O> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            tail: self.tail.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> PipelineHandle<I, O> {
    pub(crate) fn new(head: Arc<dyn Target<I>>, tail: Arc<dyn Source<O>>) -> Self {
        Self {
            head,
            tail,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 送入一則資料；佇列已滿時等待。完成後再送會回傳 `SendAfterCompletion`
    pub async fn send(&self, payload: I) -> Result<()> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.head.offer(Envelope::new(id, payload)).await {
            OfferStatus::Accepted => Ok(()),
            OfferStatus::Declined(_) | OfferStatus::Postponed(_) => {
                Err(PipelineError::SendAfterCompletion {
                    stage: self.head.label().to_string(),
                })
            }
        }
    }

    pub fn complete(&self) {
        self.head.complete();
    }

    pub fn fault(&self, error: PipelineError) {
        self.head.fault(error);
    }

    pub fn completion(&self) -> Completion {
        self.tail.completion()
    }

    /// 取出下一筆輸出；pipeline 結束後回傳 `None`
    pub async fn receive(&self) -> Option<O> {
        self.tail.receive().await.map(Envelope::into_payload)
    }

    /// 取出所有輸出直到 pipeline 結束，並回報最終結果
    pub async fn receive_all(&self) -> Result<Vec<O>> {
        let mut outputs = Vec::new();
        while let Some(output) = self.receive().await {
            outputs.push(output);
        }
        self.completion().await?;
        Ok(outputs)
    }
}

impl<I: Send + 'static, O: Send + 'static> Stage for PipelineHandle<I, O> {
    fn label(&self) -> &str {
        self.tail.label()
    }

    fn completion(&self) -> Completion {
        self.tail.completion()
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Target<I> for PipelineHandle<I, O> {
    async fn offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        self.head.offer(message).await
    }

    fn try_offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        self.head.try_offer(message)
    }

    async fn settle(&self, claims: Vec<Claim>) {
        self.head.settle(claims).await;
    }

    fn complete(&self) {
        self.head.complete();
    }

    fn fault(&self, error: PipelineError) {
        self.head.fault(error);
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Source<O> for PipelineHandle<I, O> {
    fn link_to(&self, target: Arc<dyn Target<O>>, options: LinkOptions) -> Link {
        self.tail.link_to(target, options)
    }

    async fn receive(&self) -> Option<Envelope<O>> {
        self.tail.receive().await
    }

    async fn reserve(&self) -> Option<MessageId> {
        self.tail.reserve().await
    }

    fn consume(&self, id: MessageId) -> Option<Envelope<O>> {
        self.tail.consume(id)
    }

    fn release(&self, id: MessageId) -> bool {
        self.tail.release(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::builder::Builder;
    use crate::utils::error::PipelineError;

    #[tokio::test]
    async fn test_send_after_complete_fails() {
        let handle = Builder::new().create_buffer::<u32>().end();
        handle.complete();
        let err = handle.send(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::SendAfterCompletion { .. }));
    }

    #[tokio::test]
    async fn test_handle_is_reusable_as_a_stage() {
        let inner = Builder::new()
            .create_buffer::<u32>()
            .select(|x| x * 3)
            .end();
        let outer = Builder::new()
            .create_buffer::<u32>()
            .then(std::sync::Arc::new(inner))
            .end();

        outer.send(2).await.unwrap();
        outer.complete();
        assert_eq!(outer.receive_all().await.unwrap(), vec![6]);
    }
}
