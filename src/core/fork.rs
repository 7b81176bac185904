use crate::core::blocks::Block;
use crate::core::broadcast::BroadcastBlock;
use crate::core::builder::{Builder, PipelineBuilder};
use crate::core::join::JoinBlock;
use crate::core::stage::{Emitter, Processor};
use crate::domain::model::{Envelope, LinkOptions, MessageId, Provenance};
use crate::domain::ports::{Source, Target};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// 把一條資料流複製給兩條分支，再把兩邊的輸出兩兩配對
pub struct ForkCombinator<I, O> {
    upstream: PipelineBuilder<I, O>,
}

impl<I: Send + 'static, O: Send + 'static> ForkCombinator<I, O> {
    pub(crate) fn new(upstream: PipelineBuilder<I, O>) -> Self {
        Self { upstream }
    }
}

impl<I: Send + 'static, O: Clone + Send + 'static> ForkCombinator<I, O> {
    /// 兩個閉包各自收到一個以同一個廣播 stage 為起點的 builder，回傳各自分支的結尾。
    /// 回傳的 builder 以 `(left, right)` 配對為輸出
    ///
    /// 配對依賴訊息識別碼：分支若過濾掉或多產生訊息，join 會停止輸出而不是錯配。
    pub fn then<L, R, FL, FR>(self, left: FL, right: FR) -> PipelineBuilder<I, (L, R)>
    where
        L: Send + 'static,
        R: Send + 'static,
        FL: FnOnce(PipelineBuilder<O, O>) -> PipelineBuilder<O, L>,
        FR: FnOnce(PipelineBuilder<O, O>) -> PipelineBuilder<O, R>,
    {
        let upstream_label = self.upstream.tail_label().to_string();
        let (head, tail, options) = self.upstream.into_parts();

        let numbering = Arc::new(Block::new(
            Numbering::default(),
            options
                .stage_options()
                .with_name(format!("{}.numbering", upstream_label)),
        ));
        let broadcast = Arc::new(BroadcastBlock::<O>::new(options.stage_options()));
        let branch_root = Builder::with_options(options.clone()).create(broadcast.clone());
        let (_, left_tail, _) = left(branch_root.clone()).into_parts();
        let (_, right_tail, _) = right(branch_root).into_parts();

        let join = Arc::new(JoinBlock::<L, R>::correlated(options.stage_options()));
        let left_half: Arc<dyn Target<L>> = join.left();
        let right_half: Arc<dyn Target<R>> = join.right();
        left_tail.link_to(left_half, LinkOptions::propagate());
        right_tail.link_to(right_half, LinkOptions::propagate());

        // 兩條分支都接好後才接上游，確保兩邊看到每一則訊息
        let fork_target: Arc<dyn Target<O>> = broadcast;
        numbering.link_to(fork_target, LinkOptions::propagate());
        let numbering_target: Arc<dyn Target<O>> = numbering;
        tail.link_to(numbering_target, LinkOptions::propagate());

        tracing::debug!(
            "🔀 Forked '{}' into '{}' and '{}'",
            upstream_label,
            left_tail.label(),
            right_tail.label()
        );
        PipelineBuilder::from_parts(head, join, options)
    }
}

/// 為進入分支的訊息依序編號，join 以號碼確認兩邊來自同一則輸入。
/// 原本的識別資訊保留在 provenance 中
#[derive(Default)]
struct Numbering {
    next: u64,
}

#[async_trait]
impl<T: Send + 'static> Processor<T, T> for Numbering {
    async fn process(&mut self, input: Envelope<T>, out: &mut Emitter<T>) -> Result<()> {
        let (id, provenance, payload) = input.into_parts();
        let number = MessageId(self.next);
        self.next += 1;
        out.forward(Envelope::with_provenance(
            number,
            Provenance::Merged(provenance.claims(id)),
            payload,
        ));
        Ok(())
    }
}
