use crate::core::completion::Completion;
use crate::core::outlet::{outlet, Outlet, Publisher};
use crate::core::queue::QueueReceiver;
use crate::core::stage::{
    run_concurrent, run_sequential, spawn_worker, Emitter, FaultSignal, FaultWatch, Inbox, Input,
    Processor, StageCore, StageOptions,
};
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus};
use crate::domain::ports::{Link, Source, Stage, Target};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::{ready, Future};
use std::sync::Arc;

/// 一般的 stage：一個輸入佇列、一個處理器、一個輸出佇列
pub struct Block<I, O> {
    core: Arc<StageCore>,
    inbox: Inbox<I>,
    outlet: Arc<Outlet<O>>,
}

struct Parts<I, O> {
    input: QueueReceiver<Input<I>>,
    faults: FaultWatch,
    publisher: Publisher<O>,
}

impl<I: Send + 'static, O: Send + 'static> Block<I, O> {
    /// 以自訂處理器建立 stage，一次處理一則輸入
    pub fn new<P>(processor: P, options: StageOptions) -> Self
    where
        P: Processor<I, O>,
    {
        let (block, parts) = Self::parts("block", &options);
        block.spawn_sequential(processor, parts);
        block
    }

    /// 依 `max_parallelism` 同時處理多則輸入
    pub fn new_concurrent<P>(processor: P, options: StageOptions) -> Self
    where
        P: Processor<I, O> + Clone,
    {
        let (block, parts) = Self::parts("block", &options);
        block.spawn_concurrent(processor, options.parallelism(), parts);
        block
    }

    /// 同步轉換，一進一出
    pub fn transform<F>(f: F, options: StageOptions) -> Self
    where
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        Self::transform_async(move |input| ready(Ok::<O, Infallible>(f(input))), options)
    }

    /// 非同步轉換；回傳錯誤時 stage 進入故障
    pub fn transform_async<F, Fut, E>(f: F, options: StageOptions) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (block, parts) = Self::parts("transform", &options);
        let processor = Transform {
            label: block.core.label_arc(),
            f: Arc::new(f),
        };
        block.spawn_concurrent(processor, options.parallelism(), parts);
        block
    }

    /// 一個輸入展開成零到多個輸出
    pub fn transform_many<F, It>(f: F, options: StageOptions) -> Self
    where
        F: Fn(I) -> It + Send + Sync + 'static,
        It: IntoIterator<Item = O> + Send + 'static,
    {
        Self::transform_many_async(move |input| ready(Ok::<It, Infallible>(f(input))), options)
    }

    pub fn transform_many_async<F, Fut, It, E>(f: F, options: StageOptions) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<It, E>> + Send + 'static,
        It: IntoIterator<Item = O> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (block, parts) = Self::parts("transform-many", &options);
        let processor = TransformMany {
            label: block.core.label_arc(),
            f: Arc::new(f),
        };
        block.spawn_concurrent(processor, options.parallelism(), parts);
        block
    }

    /// 送入一則新訊息
    pub async fn send(&self, payload: I) -> Result<()> {
        self.inbox.send(payload).await
    }

    fn parts(kind: &str, options: &StageOptions) -> (Self, Parts<I, O>) {
        let label = options.label_for(kind);
        let core = StageCore::new(label.clone());
        let faults = FaultSignal::new();
        let watch = faults.watch();
        let (inbox, input) = Inbox::new(label, options.capacity, faults);
        let (publisher, outlet) = outlet(core.clone(), options.capacity);
        let block = Self {
            core,
            inbox,
            outlet,
        };
        let parts = Parts {
            input,
            faults: watch,
            publisher,
        };
        (block, parts)
    }

    fn spawn_sequential<P>(&self, processor: P, parts: Parts<I, O>)
    where
        P: Processor<I, O>,
    {
        spawn_worker(
            self.core.clone(),
            run_sequential(processor, parts.input, parts.faults, parts.publisher),
        );
    }

    fn spawn_concurrent<P>(&self, processor: P, max_parallelism: usize, parts: Parts<I, O>)
    where
        P: Processor<I, O> + Clone,
    {
        if max_parallelism <= 1 {
            return self.spawn_sequential(processor, parts);
        }
        spawn_worker(
            self.core.clone(),
            run_concurrent(
                processor,
                parts.input,
                parts.faults,
                parts.publisher,
                max_parallelism,
                self.core.label_arc(),
            ),
        );
    }
}

impl<T: Send + 'static> Block<T, T> {
    /// 原樣轉送的緩衝 stage
    pub fn buffer(options: StageOptions) -> Self {
        let (block, parts) = Self::parts("buffer", &options);
        block.spawn_sequential(Passthrough, parts);
        block
    }
}

impl<T: Send + 'static> Block<T, Vec<T>> {
    /// 每 `size` 則輸入合併成一批；輸入結束時送出不足一批的剩餘資料
    pub fn batch(size: usize, options: StageOptions) -> Self {
        let (block, parts) = Self::parts("batch", &options);
        block.spawn_sequential(Batch::new(size), parts);
        block
    }
}

impl<I: Send + 'static, O: Send + 'static> Stage for Block<I, O> {
    fn label(&self) -> &str {
        self.core.label()
    }

    fn completion(&self) -> Completion {
        self.core.completion()
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Target<I> for Block<I, O> {
    async fn offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        self.inbox.offer(message).await
    }

    fn try_offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        self.inbox.try_offer(message)
    }

    async fn settle(&self, claims: Vec<Claim>) {
        self.inbox.settle(claims).await;
    }

    fn complete(&self) {
        self.inbox.complete();
    }

    fn fault(&self, error: PipelineError) {
        self.inbox.fault(error);
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Source<O> for Block<I, O> {
    fn link_to(&self, target: Arc<dyn Target<O>>, options: LinkOptions) -> Link {
        self.outlet.link_to(target, options)
    }

    async fn receive(&self) -> Option<Envelope<O>> {
        self.outlet.receive().await
    }

    async fn reserve(&self) -> Option<MessageId> {
        self.outlet.reserve().await
    }

    fn consume(&self, id: MessageId) -> Option<Envelope<O>> {
        self.outlet.consume(id)
    }

    fn release(&self, id: MessageId) -> bool {
        self.outlet.release(id)
    }
}

/// 終端 stage：只消費輸入，沒有輸出
pub struct SinkBlock<I> {
    core: Arc<StageCore>,
    inbox: Inbox<I>,
}

impl<I: Send + 'static> SinkBlock<I> {
    pub fn action<F>(f: F, options: StageOptions) -> Self
    where
        F: Fn(I) + Send + Sync + 'static,
    {
        Self::action_async(
            move |input| {
                f(input);
                ready(Ok::<(), Infallible>(()))
            },
            options,
        )
    }

    pub fn action_async<F, Fut, E>(f: F, options: StageOptions) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let label = options.label_for("action");
        let core = StageCore::new(label.clone());
        let faults = FaultSignal::new();
        let watch = faults.watch();
        let (inbox, input) = Inbox::new(label.clone(), options.capacity, faults);
        let processor = Action {
            label: label.clone(),
            f: Arc::new(f),
        };

        let max_parallelism = options.parallelism();
        if max_parallelism <= 1 {
            spawn_worker(
                core.clone(),
                run_sequential(processor, input, watch, Publisher::<()>::discard()),
            );
        } else {
            spawn_worker(
                core.clone(),
                run_concurrent(
                    processor,
                    input,
                    watch,
                    Publisher::<()>::discard(),
                    max_parallelism,
                    label,
                ),
            );
        }
        Self { core, inbox }
    }

    pub async fn send(&self, payload: I) -> Result<()> {
        self.inbox.send(payload).await
    }
}

impl<I: Send + 'static> Stage for SinkBlock<I> {
    fn label(&self) -> &str {
        self.core.label()
    }

    fn completion(&self) -> Completion {
        self.core.completion()
    }
}

#[async_trait]
impl<I: Send + 'static> Target<I> for SinkBlock<I> {
    async fn offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        self.inbox.offer(message).await
    }

    fn try_offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        self.inbox.try_offer(message)
    }

    fn complete(&self) {
        self.inbox.complete();
    }

    fn fault(&self, error: PipelineError) {
        self.inbox.fault(error);
    }
}

struct Passthrough;

#[async_trait]
impl<T: Send + 'static> Processor<T, T> for Passthrough {
    async fn process(&mut self, input: Envelope<T>, out: &mut Emitter<T>) -> Result<()> {
        out.forward(input);
        Ok(())
    }
}

struct Transform<F> {
    label: Arc<str>,
    f: Arc<F>,
}

impl<F> Clone for Transform<F> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            f: self.f.clone(),
        }
    }
}

#[async_trait]
impl<I, O, F, Fut, E> Processor<I, O> for Transform<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async fn process(&mut self, input: Envelope<I>, out: &mut Emitter<O>) -> Result<()> {
        let output = (self.f)(input.into_payload())
            .await
            .map_err(|e| PipelineError::processing(self.label.as_ref(), e))?;
        out.emit(output);
        Ok(())
    }
}

struct TransformMany<F> {
    label: Arc<str>,
    f: Arc<F>,
}

impl<F> Clone for TransformMany<F> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            f: self.f.clone(),
        }
    }
}

#[async_trait]
impl<I, O, F, Fut, It, E> Processor<I, O> for TransformMany<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<It, E>> + Send + 'static,
    It: IntoIterator<Item = O> + Send + 'static,
    E: Display + Send + 'static,
{
    async fn process(&mut self, input: Envelope<I>, out: &mut Emitter<O>) -> Result<()> {
        let outputs = (self.f)(input.into_payload())
            .await
            .map_err(|e| PipelineError::processing(self.label.as_ref(), e))?;
        for output in outputs {
            out.emit(output);
        }
        Ok(())
    }
}

struct Batch<T> {
    size: usize,
    items: Vec<T>,
    sources: Vec<Claim>,
}

impl<T> Batch<T> {
    fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            items: Vec::with_capacity(size),
            sources: Vec::with_capacity(size),
        }
    }

    fn emit_batch(&mut self, out: &mut Emitter<Vec<T>>) {
        let items = std::mem::replace(&mut self.items, Vec::with_capacity(self.size));
        let sources = std::mem::take(&mut self.sources);
        out.emit_merged(items, sources);
    }
}

#[async_trait]
impl<T: Send + 'static> Processor<T, Vec<T>> for Batch<T> {
    async fn process(&mut self, input: Envelope<T>, out: &mut Emitter<Vec<T>>) -> Result<()> {
        self.sources.extend(out.hold());
        self.items.push(input.into_payload());
        if self.items.len() >= self.size {
            self.emit_batch(out);
        }
        Ok(())
    }

    async fn flush(&mut self, out: &mut Emitter<Vec<T>>) -> Result<()> {
        if !self.items.is_empty() {
            self.emit_batch(out);
        }
        Ok(())
    }
}

struct Action<F> {
    label: Arc<str>,
    f: Arc<F>,
}

impl<F> Clone for Action<F> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            f: self.f.clone(),
        }
    }
}

#[async_trait]
impl<I, F, Fut, E> Processor<I, ()> for Action<F>
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async fn process(&mut self, input: Envelope<I>, _out: &mut Emitter<()>) -> Result<()> {
        (self.f)(input.into_payload())
            .await
            .map_err(|e| PipelineError::processing(self.label.as_ref(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_transform_preserves_order() {
        let block = Block::transform(|x: u32| x * 2, StageOptions::default());
        for i in 0..5 {
            block.send(i).await.unwrap();
        }
        block.complete();

        let mut seen = Vec::new();
        while let Some(message) = block.receive().await {
            seen.push(message.into_payload());
        }
        assert_eq!(seen, vec![0, 2, 4, 6, 8]);
        assert!(block.completion().await.is_ok());
    }

    #[tokio::test]
    async fn test_batch_flushes_remainder() {
        let block = Block::batch(3, StageOptions::default());
        for i in 0..7u32 {
            block.send(i).await.unwrap();
        }
        block.complete();

        let mut sizes = Vec::new();
        while let Some(message) = block.receive().await {
            sizes.push(message.into_payload().len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_batch_size_zero_is_clamped() {
        let block = Block::batch(0, StageOptions::default());
        block.send("a").await.unwrap();
        block.complete();
        let message = block.receive().await.unwrap();
        assert_eq!(message.into_payload(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_transform_error_faults_stage() {
        let block = Block::transform_async(
            |x: u32| async move {
                if x == 2 {
                    Err("two is not allowed")
                } else {
                    Ok(x)
                }
            },
            StageOptions::named("picky"),
        );
        for i in 0..4 {
            let _ = block.send(i).await;
        }
        block.complete();

        let err = block.completion().await.unwrap_err();
        assert!(matches!(err, PipelineError::ProcessingError { ref stage, .. } if stage == "picky"));
    }

    #[tokio::test]
    async fn test_send_after_complete_is_rejected() {
        let block = Block::<u32, u32>::buffer(StageOptions::named("buffer"));
        block.complete();
        let err = block.send(1).await.unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[tokio::test]
    async fn test_concurrent_transform_processes_everything() {
        let block = Block::transform_async(
            |x: u64| async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - x))).await;
                Ok::<u64, Infallible>(x)
            },
            StageOptions::default().with_parallelism(4),
        );
        for i in 0..5 {
            block.send(i).await.unwrap();
        }
        block.complete();

        let mut seen = Vec::new();
        while let Some(message) = block.receive().await {
            seen.push(message.into_payload());
        }
        // 先送入的較晚完成，輸出仍依輸入順序
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    struct Recorder {
        inner: Block<u32, u32>,
        settled: std::sync::Mutex<Vec<Claim>>,
    }

    impl Stage for Recorder {
        fn label(&self) -> &str {
            self.inner.label()
        }

        fn completion(&self) -> Completion {
            self.inner.completion()
        }
    }

    #[async_trait]
    impl Target<u32> for Recorder {
        async fn offer(&self, message: Envelope<u32>) -> OfferStatus<u32> {
            self.inner.offer(message).await
        }

        fn try_offer(&self, message: Envelope<u32>) -> OfferStatus<u32> {
            self.inner.try_offer(message)
        }

        async fn settle(&self, claims: Vec<Claim>) {
            self.settled.lock().unwrap().extend(claims);
        }

        fn complete(&self) {
            self.inner.complete();
        }

        fn fault(&self, error: PipelineError) {
            self.inner.fault(error);
        }
    }

    #[tokio::test]
    async fn test_settled_claims_pass_through_in_order() {
        let block = Block::transform(|x: u32| x + 1, StageOptions::default().with_parallelism(3));
        let recorder = Arc::new(Recorder {
            inner: Block::buffer(StageOptions::default()),
            settled: std::sync::Mutex::new(Vec::new()),
        });
        let _link = block.link_to(recorder.clone(), LinkOptions::propagate());

        block.offer(Envelope::new(MessageId(1), 1)).await;
        block.settle(vec![Claim::new(MessageId(2), true)]).await;
        block.settle(Vec::new()).await;
        block.offer(Envelope::new(MessageId(3), 3)).await;
        block.complete();

        let mut ids = Vec::new();
        while let Some(message) = recorder.inner.receive().await {
            ids.push(message.id());
        }
        recorder.completion().await.unwrap();
        assert_eq!(ids, vec![MessageId(1), MessageId(3)]);
        assert_eq!(
            *recorder.settled.lock().unwrap(),
            vec![Claim::new(MessageId(2), true)]
        );
    }

    #[tokio::test]
    async fn test_sink_completes_after_last_action() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let sink = SinkBlock::action(
            move |_: u32| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            StageOptions::default(),
        );
        for i in 0..3 {
            sink.send(i).await.unwrap();
        }
        sink.complete();
        sink.completion().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let block = Block::<u32, u32>::buffer(StageOptions::default());
        block.send(1).await.unwrap();
        block.send(2).await.unwrap();

        let id = block.reserve().await.unwrap();
        assert!(block.reserve().await.is_none());
        assert!(block.release(id));

        let id = block.reserve().await.unwrap();
        let message = block.consume(id).unwrap();
        assert_eq!(*message.payload(), 1);
        assert!(block.consume(id).is_none());
    }
}
