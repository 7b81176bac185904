use crate::core::completion::Completion;
use crate::core::outlet::{outlet, Outlet, Publisher};
use crate::core::queue::QueueReceiver;
use crate::core::stage::{
    publish_or_fault, spawn_worker, Emitter, FaultSignal, FaultWatch, Inbox, Input, StageCore,
    StageOptions, WorkerExit,
};
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus, Provenance};
use crate::domain::ports::{Link, Source, Stage, Target};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// 配對模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// 依到達順序配對
    Fifo,
    /// 依到達順序配對，且兩邊的識別碼必須相同；不同時停止輸出
    Correlated,
}

/// 兩個輸入、一個輸出的配對 stage。第 n 個左輸入與第 n 個右輸入組成第 n 個輸出
pub struct JoinBlock<L, R> {
    core: Arc<StageCore>,
    left: Arc<JoinHalf<L>>,
    right: Arc<JoinHalf<R>>,
    outlet: Arc<Outlet<(L, R)>>,
}

/// join 的其中一個輸入
pub struct JoinHalf<T> {
    label: Arc<str>,
    core: Arc<StageCore>,
    inbox: Inbox<T>,
}

impl<L: Send + 'static, R: Send + 'static> JoinBlock<L, R> {
    pub fn new(options: StageOptions) -> Self {
        Self::with_mode(JoinMode::Fifo, options)
    }

    pub fn correlated(options: StageOptions) -> Self {
        Self::with_mode(JoinMode::Correlated, options)
    }

    pub fn with_mode(mode: JoinMode, options: StageOptions) -> Self {
        let label = options.label_for("join");
        let core = StageCore::new(label.clone());
        let faults = FaultSignal::new();
        let watch = faults.watch();

        let left_label: Arc<str> = Arc::from(format!("{}.left", label));
        let right_label: Arc<str> = Arc::from(format!("{}.right", label));
        let (left_inbox, left_input) =
            Inbox::new(left_label.clone(), options.capacity, faults.clone());
        let (right_inbox, right_input) =
            Inbox::new(right_label.clone(), options.capacity, faults);
        let (publisher, outlet) = outlet(core.clone(), options.capacity);

        let pairing = Pairing {
            label: label.clone(),
            mode,
            left: left_input,
            right: right_input,
            faults: watch,
        };
        spawn_worker(core.clone(), pairing.run(publisher));

        Self {
            left: Arc::new(JoinHalf {
                label: left_label,
                core: core.clone(),
                inbox: left_inbox,
            }),
            right: Arc::new(JoinHalf {
                label: right_label,
                core: core.clone(),
                inbox: right_inbox,
            }),
            core,
            outlet,
        }
    }

    pub fn left(&self) -> Arc<JoinHalf<L>> {
        self.left.clone()
    }

    pub fn right(&self) -> Arc<JoinHalf<R>> {
        self.right.clone()
    }
}

struct Pairing<L, R> {
    label: Arc<str>,
    mode: JoinMode,
    left: QueueReceiver<Input<L>>,
    right: QueueReceiver<Input<R>>,
    faults: FaultWatch,
}

/// 讀取下一則訊息；途中遇到的已消化輸入直接往下游回報
async fn next_or_fault<T: Send + 'static, O: Send + 'static>(
    input: &mut QueueReceiver<Input<T>>,
    faults: &mut FaultWatch,
    publisher: &Publisher<O>,
) -> Result<Option<Envelope<T>>> {
    loop {
        let next = tokio::select! {
            biased;
            error = faults.raised() => return Err(error),
            next = input.recv() => next,
        };
        match next {
            Some(Input::Message(message)) => return Ok(Some(message)),
            Some(Input::Settled(claims)) => {
                publish_or_fault(publisher, Emitter::settled(claims), faults).await?
            }
            None => return Ok(None),
        }
    }
}

impl<L: Send + 'static, R: Send + 'static> Pairing<L, R> {
    async fn run(mut self, publisher: Publisher<(L, R)>) -> WorkerExit<(L, R)> {
        let outcome = self.pair_all(&publisher).await;
        (outcome, publisher)
    }

    async fn pair_all(&mut self, publisher: &Publisher<(L, R)>) -> Result<()> {
        let mut paired = 0u64;
        loop {
            let left = next_or_fault(&mut self.left, &mut self.faults, publisher).await?;
            let right = next_or_fault(&mut self.right, &mut self.faults, publisher).await?;

            match (left, right) {
                (Some(left), Some(right)) => {
                    if self.mode == JoinMode::Correlated && left.id() != right.id() {
                        let detail = format!(
                            "pair {} has left {} but right {}",
                            paired,
                            left.id(),
                            right.id()
                        );
                        return self.stall(detail).await;
                    }
                    let (id, provenance, left) = left.into_parts();
                    let mut claims = provenance.claims(id);
                    claims.extend(right.provenance().claims(right.id()));
                    let payload = (left, right.into_payload());
                    let mut out = Emitter::detached();
                    out.forward(Envelope::with_provenance(
                        id,
                        Provenance::Merged(claims),
                        payload,
                    ));
                    tokio::select! {
                        biased;
                        error = self.faults.raised() => return Err(error),
                        _ = publisher.publish(out) => {}
                    }
                    paired += 1;
                }
                (None, None) => return Ok(()),
                (left, right) => {
                    let side = if left.is_some() { "left" } else { "right" };
                    let detail = format!("{} input has messages beyond pair {}", side, paired);
                    if self.mode == JoinMode::Correlated {
                        return self.stall(detail).await;
                    }
                    let dropped = 1 + self.drain(side).await;
                    tracing::warn!(
                        "⚠️ Join '{}' dropped {} unpaired message(s): {}",
                        self.label,
                        dropped,
                        detail
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn drain(&mut self, side: &str) -> usize {
        let mut count = 0;
        if side == "left" {
            while let Some(input) = self.left.recv().await {
                count += usize::from(matches!(input, Input::Message(_)));
            }
        } else {
            while let Some(input) = self.right.recv().await {
                count += usize::from(matches!(input, Input::Message(_)));
            }
        }
        count
    }

    /// 兩邊已無法正確配對：不再輸出，只等待故障
    async fn stall(&mut self, detail: String) -> Result<()> {
        tracing::warn!("⚠️ Join '{}' stalled: {}", self.label, detail);
        Err(self.faults.raised().await)
    }
}

impl<L: Send + 'static, R: Send + 'static> Stage for JoinBlock<L, R> {
    fn label(&self) -> &str {
        self.core.label()
    }

    fn completion(&self) -> Completion {
        self.core.completion()
    }
}

#[async_trait]
impl<L: Send + 'static, R: Send + 'static> Source<(L, R)> for JoinBlock<L, R> {
    fn link_to(&self, target: Arc<dyn Target<(L, R)>>, options: LinkOptions) -> Link {
        self.outlet.link_to(target, options)
    }

    async fn receive(&self) -> Option<Envelope<(L, R)>> {
        self.outlet.receive().await
    }

    async fn reserve(&self) -> Option<MessageId> {
        self.outlet.reserve().await
    }

    fn consume(&self, id: MessageId) -> Option<Envelope<(L, R)>> {
        self.outlet.consume(id)
    }

    fn release(&self, id: MessageId) -> bool {
        self.outlet.release(id)
    }
}

impl<T: Send + 'static> Stage for JoinHalf<T> {
    fn label(&self) -> &str {
        &self.label
    }

    /// 與所屬的 join 相同
    fn completion(&self) -> Completion {
        self.core.completion()
    }
}

#[async_trait]
impl<T: Send + 'static> Target<T> for JoinHalf<T> {
    async fn offer(&self, message: Envelope<T>) -> OfferStatus<T> {
        self.inbox.offer(message).await
    }

    fn try_offer(&self, message: Envelope<T>) -> OfferStatus<T> {
        self.inbox.try_offer(message)
    }

    async fn settle(&self, claims: Vec<Claim>) {
        self.inbox.settle(claims).await;
    }

    fn complete(&self) {
        self.inbox.complete();
    }

    /// 任一邊故障都會讓整個 join 故障
    fn fault(&self, error: PipelineError) {
        self.inbox.fault(error);
    }
}
