use crate::config::options::BuilderOptions;
use crate::core::blocks::Block;
use crate::core::completion::Completion;
use crate::core::fork::ForkCombinator;
use crate::core::handle::PipelineHandle;
use crate::core::interceptor::TimingInterceptor;
use crate::domain::model::LinkOptions;
use crate::domain::ports::{Propagator, Source, Stage, Target};
use std::sync::Arc;

/// 建立 pipeline 的起點
///
/// 連結 stage 時會產生背景 task，因此必須在 tokio runtime 內使用。
#[derive(Debug, Clone, Default)]
pub struct Builder {
    options: BuilderOptions,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: BuilderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// 以指定的 stage 作為起點。起點本身不會被計時
    pub fn create<I, O, S>(&self, root: Arc<S>) -> PipelineBuilder<I, O>
    where
        I: Send + 'static,
        O: Send + 'static,
        S: Propagator<I, O> + 'static,
    {
        let head: Arc<dyn Target<I>> = root.clone();
        PipelineBuilder::from_parts(head, root, self.options.clone())
    }

    /// 以新的緩衝 stage 作為起點
    pub fn create_buffer<T: Send + 'static>(&self) -> PipelineBuilder<T, T> {
        self.create(Arc::new(Block::<T, T>::buffer(self.options.stage_options())))
    }

    /// 以一組現成的資料作為來源；全部送出後自動完成
    pub fn from_iter<T, It>(&self, source: It) -> PipelineBuilder<T, T>
    where
        T: Send + 'static,
        It: IntoIterator<Item = T>,
        It::IntoIter: Send + 'static,
    {
        let buffer = Arc::new(Block::<T, T>::buffer(self.options.stage_options()));
        let feeder = buffer.clone();
        let items = source.into_iter();
        tokio::spawn(async move {
            let mut sent = 0usize;
            for item in items {
                if let Err(e) = feeder.send(item).await {
                    tracing::warn!("⚠️ Source stopped after {} item(s): {}", sent, e);
                    return;
                }
                sent += 1;
            }
            tracing::debug!("📤 Source '{}' sent {} item(s)", feeder.label(), sent);
            feeder.complete();
        });
        self.create(buffer)
    }
}

/// 組裝中的 pipeline：`I` 為第一個 stage 的輸入，`O` 為目前最後一個 stage 的輸出
///
/// 每次 `then` 都會消耗此值並回傳新的 builder。對已經 `end` 過的 builder 的複本
/// 再呼叫 `then`，會從共用的前段分岔出另一條鏈，上游的訊息只會交給其中一條。
pub struct PipelineBuilder<I, O> {
    head: Arc<dyn Target<I>>,
    tail: Arc<dyn Source<O>>,
    options: BuilderOptions,
}

impl<I, O> Clone for PipelineBuilder<I, O> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            tail: self.tail.clone(),
            options: self.options.clone(),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> PipelineBuilder<I, O> {
    pub(crate) fn from_parts(
        head: Arc<dyn Target<I>>,
        tail: Arc<dyn Source<O>>,
        options: BuilderOptions,
    ) -> Self {
        Self {
            head,
            tail,
            options,
        }
    }

    pub(crate) fn into_parts(self) -> (Arc<dyn Target<I>>, Arc<dyn Source<O>>, BuilderOptions) {
        (self.head, self.tail, self.options)
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// 目前最後一個 stage 的名稱
    pub fn tail_label(&self) -> &str {
        self.tail.label()
    }

    /// 接上下一個 stage；有設定計時回呼時先以 `TimingInterceptor` 包住
    pub fn then<N, S>(self, stage: Arc<S>) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        S: Propagator<O, N> + 'static,
    {
        if self.options.is_instrumented() {
            let timed = Arc::new(TimingInterceptor::<O, N>::wrap(stage, &self.options));
            self.attach(timed)
        } else {
            self.attach(stage)
        }
    }

    fn attach<N, S>(self, stage: Arc<S>) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        S: Propagator<O, N> + 'static,
    {
        let target: Arc<dyn Target<O>> = stage.clone();
        self.tail.link_to(target, LinkOptions::propagate());
        PipelineBuilder {
            head: self.head,
            tail: stage,
            options: self.options,
        }
    }

    /// 接上沒有輸出的終端 stage，結束組裝。終端 stage 不會被計時
    pub fn then_sink<S>(self, sink: Arc<S>) -> TerminalHandle
    where
        S: Target<O> + 'static,
    {
        let target: Arc<dyn Target<O>> = sink.clone();
        self.tail.link_to(target, LinkOptions::propagate());
        TerminalHandle { block: sink }
    }

    pub fn fork(self) -> ForkCombinator<I, O> {
        ForkCombinator::new(self)
    }

    /// 結束組裝，回傳可送入與取出資料的 handle
    pub fn end(self) -> PipelineHandle<I, O> {
        PipelineHandle::new(self.head, self.tail)
    }
}

/// 以終端 stage 結束的 pipeline
#[derive(Clone)]
pub struct TerminalHandle {
    block: Arc<dyn Stage>,
}

impl TerminalHandle {
    pub fn completion(&self) -> Completion {
        self.block.completion()
    }

    /// 終端 stage 本身
    pub fn block(&self) -> &Arc<dyn Stage> {
        &self.block
    }

    pub fn label(&self) -> &str {
        self.block.label()
    }
}

impl std::fmt::Debug for TerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("block", &self.block.label())
            .finish()
    }
}
