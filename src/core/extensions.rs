use crate::core::blocks::{Block, SinkBlock};
use crate::core::builder::{PipelineBuilder, TerminalHandle};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// 常用 stage 的捷徑。建立的 stage 使用 `BuilderOptions::stage` 的設定
impl<I: Send + 'static, O: Send + 'static> PipelineBuilder<I, O> {
    pub fn select<N, F>(self, f: F) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        F: Fn(O) -> N + Send + Sync + 'static,
    {
        let stage = Block::transform(f, self.options().stage_options());
        self.then(Arc::new(stage))
    }

    pub fn select_async<N, F, Fut, E>(self, f: F) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        F: Fn(O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<N, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let stage = Block::transform_async(f, self.options().stage_options());
        self.then(Arc::new(stage))
    }

    /// 只保留符合條件的資料
    pub fn filter<F>(self, predicate: F) -> PipelineBuilder<I, O>
    where
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        let stage = Block::transform_many(
            move |item: O| if predicate(&item) { Some(item) } else { None },
            self.options().stage_options(),
        );
        self.then(Arc::new(stage))
    }

    pub fn batch(self, size: usize) -> PipelineBuilder<I, Vec<O>> {
        let stage = Block::<O, Vec<O>>::batch(size, self.options().stage_options());
        self.then(Arc::new(stage))
    }

    pub fn for_each<F>(self, f: F) -> TerminalHandle
    where
        F: Fn(O) + Send + Sync + 'static,
    {
        let sink = SinkBlock::action(f, self.options().stage_options());
        self.then_sink(Arc::new(sink))
    }
}

impl<I, C> PipelineBuilder<I, C>
where
    I: Send + 'static,
    C: IntoIterator + Send + 'static,
    C::Item: Send + 'static,
{
    /// 把每筆集合展開成個別的資料
    pub fn select_many(self) -> PipelineBuilder<I, C::Item> {
        let stage = Block::transform_many(|items: C| items, self.options().stage_options());
        self.then(Arc::new(stage))
    }
}
