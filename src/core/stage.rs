use crate::core::completion::{Completion, CompletionSource};
use crate::core::outlet::{Item, Publisher};
use crate::core::queue::{queue, Capacity, QueueReceiver, QueueSender, TrySendError};
use crate::domain::model::{Claim, Envelope, MessageId, OfferStatus, Provenance};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

static NEXT_STAGE: AtomicU64 = AtomicU64::new(1);

/// 單一 stage 的執行設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    pub name: Option<String>,
    pub capacity: Capacity,
    pub max_parallelism: usize,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            name: None,
            capacity: Capacity::Unbounded,
            max_parallelism: 1,
        }
    }
}

impl StageOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self::default().with_name(name)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bounded(mut self, capacity: usize) -> Self {
        self.capacity = Capacity::Bounded(capacity);
        self
    }

    pub fn with_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn parallelism(&self) -> usize {
        self.max_parallelism.max(1)
    }

    pub(crate) fn label_for(&self, kind: &str) -> Arc<str> {
        match &self.name {
            Some(name) => Arc::from(name.as_str()),
            None => Arc::from(format!(
                "{}-{}",
                kind,
                NEXT_STAGE.fetch_add(1, Ordering::Relaxed)
            )),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// stage 的共用狀態：名稱、完成狀態與 worker 結果
pub(crate) struct StageCore {
    label: Arc<str>,
    completion: CompletionSource,
    worker_outcome: OnceLock<Result<()>>,
}

impl StageCore {
    pub(crate) fn new(label: Arc<str>) -> Arc<Self> {
        Arc::new(Self {
            completion: CompletionSource::new(label.clone()),
            label,
            worker_outcome: OnceLock::new(),
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn label_arc(&self) -> Arc<str> {
        self.label.clone()
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.completion()
    }

    pub(crate) fn outcome(&self) -> Option<Result<()>> {
        self.completion.outcome()
    }

    pub(crate) fn is_faulted(&self) -> bool {
        matches!(self.completion.outcome(), Some(Err(_)))
    }

    /// worker 結束。故障立即完成；有輸出的 stage 要等輸出被取完
    pub(crate) fn finish(&self, outcome: Result<()>, has_output: bool) {
        match &outcome {
            Ok(()) => tracing::debug!("✅ Stage '{}' finished processing", self.label),
            Err(e) => tracing::warn!("❌ Stage '{}' faulted: {}", self.label, e),
        }
        let _ = self.worker_outcome.set(outcome.clone());
        if outcome.is_err() || !has_output {
            self.completion.resolve(outcome);
        }
    }

    /// 輸出佇列已關閉且清空
    pub(crate) fn drained(&self) {
        let outcome = self
            .worker_outcome
            .get()
            .cloned()
            .unwrap_or_else(|| Err(self.aborted("worker stopped before reporting an outcome")));
        self.completion.resolve(outcome);
    }

    pub(crate) fn aborted(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::StageAborted {
            stage: self.label.to_string(),
            message: message.into(),
        }
    }
}

/// 故障通知；可由多個輸入端共用
pub(crate) struct FaultSignal {
    tx: watch::Sender<Option<PipelineError>>,
}

impl FaultSignal {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self { tx })
    }

    pub(crate) fn raise(&self, error: PipelineError) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(error);
            true
        })
    }

    pub(crate) fn watch(&self) -> FaultWatch {
        FaultWatch {
            rx: self.tx.subscribe(),
        }
    }
}

pub(crate) struct FaultWatch {
    rx: watch::Receiver<Option<PipelineError>>,
}

impl FaultWatch {
    /// 等到故障發生；通知端被丟棄時永遠不會返回
    pub(crate) async fn raised(&mut self) -> PipelineError {
        let raised = match self.rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        match raised {
            Some(error) => error,
            None => std::future::pending().await,
        }
    }
}

/// 輸入佇列中的項目
pub(crate) enum Input<T> {
    Message(Envelope<T>),
    /// 上游已消化、沒有產生輸出的輸入
    Settled(Vec<Claim>),
}

fn declined<T>(rejected: Input<T>) -> OfferStatus<T> {
    match rejected {
        Input::Message(message) => OfferStatus::Declined(message),
        Input::Settled(_) => unreachable!("only messages are offered"),
    }
}

/// stage 的輸入端
pub(crate) struct Inbox<T> {
    label: Arc<str>,
    sender: Mutex<Option<QueueSender<Input<T>>>>,
    faults: Arc<FaultSignal>,
    next_id: AtomicU64,
}

impl<T: Send + 'static> Inbox<T> {
    pub(crate) fn new(
        label: Arc<str>,
        capacity: Capacity,
        faults: Arc<FaultSignal>,
    ) -> (Self, QueueReceiver<Input<T>>) {
        let (tx, rx) = queue(capacity);
        let inbox = Self {
            label,
            sender: Mutex::new(Some(tx)),
            faults,
            next_id: AtomicU64::new(0),
        };
        (inbox, rx)
    }

    fn sender(&self) -> Option<QueueSender<Input<T>>> {
        lock(&self.sender).clone()
    }

    pub(crate) async fn offer(&self, message: Envelope<T>) -> OfferStatus<T> {
        let Some(tx) = self.sender() else {
            return OfferStatus::Declined(message);
        };
        match tx.send(Input::Message(message)).await {
            Ok(()) => OfferStatus::Accepted,
            Err(rejected) => declined(rejected),
        }
    }

    pub(crate) fn try_offer(&self, message: Envelope<T>) -> OfferStatus<T> {
        let Some(tx) = self.sender() else {
            return OfferStatus::Declined(message);
        };
        match tx.try_send(Input::Message(message)) {
            Ok(()) => OfferStatus::Accepted,
            Err(TrySendError::Full(Input::Message(message))) => OfferStatus::Postponed(message),
            Err(TrySendError::Full(rejected)) | Err(TrySendError::Closed(rejected)) => {
                declined(rejected)
            }
        }
    }

    /// 排在已送入的訊息之後，由 worker 原樣轉給下游
    pub(crate) async fn settle(&self, claims: Vec<Claim>) {
        if claims.is_empty() {
            return;
        }
        let Some(tx) = self.sender() else {
            tracing::trace!(
                "Stage '{}' is closed, dropping {} settled claim(s)",
                self.label,
                claims.len()
            );
            return;
        };
        let _ = tx.send(Input::Settled(claims)).await;
    }

    /// 以此輸入端自己的編號包裝後送入
    pub(crate) async fn send(&self, payload: T) -> Result<()> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.offer(Envelope::new(id, payload)).await {
            OfferStatus::Accepted => Ok(()),
            OfferStatus::Declined(_) | OfferStatus::Postponed(_) => {
                Err(PipelineError::SendAfterCompletion {
                    stage: self.label.to_string(),
                })
            }
        }
    }

    pub(crate) fn complete(&self) {
        if lock(&self.sender).take().is_some() {
            tracing::debug!("🏁 Stage '{}' input completed", self.label);
        }
    }

    pub(crate) fn fault(&self, error: PipelineError) {
        self.faults.raise(error);
        self.complete();
    }
}

/// 處理一則輸入時收集輸出，並記錄輸出與輸入的關係
///
/// 一個輸出沿用輸入的 provenance；多個輸出標記最後一個；沒有輸出的輸入
/// 回報為已消化，除非被 `hold` 保留待合併。
pub struct Emitter<O> {
    input: Option<(MessageId, Provenance)>,
    held: bool,
    pending: Vec<Pending<O>>,
}

enum Pending<O> {
    Derived(O),
    Merged(O, Vec<Claim>),
    Forwarded(Envelope<O>),
    Settled(Vec<Claim>),
}

impl<O> Emitter<O> {
    pub(crate) fn for_input(id: MessageId, provenance: Provenance) -> Self {
        Self {
            input: Some((id, provenance)),
            held: false,
            pending: Vec::new(),
        }
    }

    pub(crate) fn detached() -> Self {
        Self {
            input: None,
            held: false,
            pending: Vec::new(),
        }
    }

    pub(crate) fn settled(claims: Vec<Claim>) -> Self {
        let mut out = Self::detached();
        out.settle(claims);
        out
    }

    /// 回報已消化、沒有輸出的輸入
    pub fn settle(&mut self, claims: Vec<Claim>) {
        if !claims.is_empty() {
            self.pending.push(Pending::Settled(claims));
        }
    }

    /// 由目前的輸入衍生出一則輸出
    pub fn emit(&mut self, payload: O) {
        self.pending.push(Pending::Derived(payload));
    }

    /// 由多個（先前保留的）輸入合併出一則輸出
    pub fn emit_merged(&mut self, payload: O, sources: Vec<Claim>) {
        self.pending.push(Pending::Merged(payload, sources));
    }

    /// 原封不動地送出一則已有識別資訊的訊息
    pub fn forward(&mut self, envelope: Envelope<O>) {
        self.pending.push(Pending::Forwarded(envelope));
    }

    /// 保留目前的輸入，稍後把回傳的 claim 交給 `emit_merged`
    pub fn hold(&mut self) -> Vec<Claim> {
        self.held = true;
        match &self.input {
            Some((id, provenance)) => provenance.claims(*id),
            None => Vec::new(),
        }
    }

    pub(crate) fn into_items(self) -> Vec<Item<O>> {
        let Self {
            input,
            held,
            pending,
        } = self;
        let derived = pending
            .iter()
            .filter(|p| matches!(p, Pending::Derived(_)))
            .count();
        let forwarded = pending.iter().any(|p| matches!(p, Pending::Forwarded(_)));

        let mut items = Vec::with_capacity(pending.len() + 1);
        let mut seen = 0;
        for entry in pending {
            let envelope = match (entry, &input) {
                (Pending::Derived(payload), Some((id, provenance))) => {
                    seen += 1;
                    let provenance = if derived == 1 {
                        provenance.clone()
                    } else {
                        provenance.split(seen == derived)
                    };
                    Envelope::with_provenance(*id, provenance, payload)
                }
                // flush 階段沒有對應的輸入
                (Pending::Derived(payload), None) => Envelope::with_provenance(
                    MessageId::default(),
                    Provenance::Merged(Vec::new()),
                    payload,
                ),
                (Pending::Merged(payload, sources), _) => {
                    let id = sources.last().map(|c| c.id).unwrap_or_default();
                    Envelope::with_provenance(id, Provenance::Merged(sources), payload)
                }
                (Pending::Forwarded(envelope), _) => envelope,
                (Pending::Settled(claims), _) => {
                    items.push(Item::Settled(claims));
                    continue;
                }
            };
            items.push(Item::Message(envelope));
        }

        if let Some((id, provenance)) = input {
            if derived == 0 && !forwarded && !held {
                items.push(Item::Settled(provenance.claims(id)));
            }
        }
        items
    }
}

/// stage 的處理邏輯
#[async_trait]
pub trait Processor<I: Send + 'static, O: Send + 'static>: Send + 'static {
    async fn process(&mut self, input: Envelope<I>, out: &mut Emitter<O>) -> Result<()>;

    /// 上游回報已消化的輸入；與訊息依序處理，預設原樣往下游傳
    async fn settle(&mut self, claims: Vec<Claim>, out: &mut Emitter<O>) -> Result<()> {
        out.settle(claims);
        Ok(())
    }

    /// 輸入結束後呼叫一次，可輸出尚未送出的資料
    async fn flush(&mut self, _out: &mut Emitter<O>) -> Result<()> {
        Ok(())
    }
}

pub(crate) type WorkerExit<O> = (Result<()>, Publisher<O>);

pub(crate) async fn publish_or_fault<O: Send + 'static>(
    publisher: &Publisher<O>,
    out: Emitter<O>,
    faults: &mut FaultWatch,
) -> Result<()> {
    tokio::select! {
        biased;
        error = faults.raised() => Err(error),
        _ = publisher.publish(out) => Ok(()),
    }
}

async fn flush<I, O, P>(processor: &mut P, publisher: &Publisher<O>) -> Result<()>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Processor<I, O>,
{
    let mut out = Emitter::detached();
    processor.flush(&mut out).await?;
    publisher.publish(out).await;
    Ok(())
}

async fn drive<I, O, P>(
    processor: &mut P,
    input: &mut QueueReceiver<Input<I>>,
    faults: &mut FaultWatch,
    publisher: &Publisher<O>,
) -> Result<()>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Processor<I, O>,
{
    loop {
        let next = tokio::select! {
            biased;
            error = faults.raised() => return Err(error),
            next = input.recv() => next,
        };
        let out = match next {
            Some(Input::Message(message)) => {
                let mut out = Emitter::for_input(message.id(), message.provenance().clone());
                processor.process(message, &mut out).await?;
                out
            }
            Some(Input::Settled(claims)) => {
                let mut out = Emitter::detached();
                processor.settle(claims, &mut out).await?;
                out
            }
            None => break,
        };
        publish_or_fault(publisher, out, faults).await?;
    }
    flush(processor, publisher).await
}

pub(crate) async fn run_sequential<I, O, P>(
    mut processor: P,
    mut input: QueueReceiver<Input<I>>,
    mut faults: FaultWatch,
    publisher: Publisher<O>,
) -> WorkerExit<O>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Processor<I, O>,
{
    let outcome = drive(&mut processor, &mut input, &mut faults, &publisher).await;
    (outcome, publisher)
}

/// 依輸入編號依序送出已完成的結果
async fn publish_ready<O: Send + 'static>(
    ready: &mut BTreeMap<u64, Emitter<O>>,
    next_publish: &mut u64,
    publisher: &Publisher<O>,
    faults: &mut FaultWatch,
) -> Result<()> {
    while let Some(out) = ready.remove(next_publish) {
        publish_or_fault(publisher, out, faults).await?;
        *next_publish += 1;
    }
    Ok(())
}

async fn drive_concurrent<I, O, P>(
    processor: &mut P,
    input: &mut QueueReceiver<Input<I>>,
    faults: &mut FaultWatch,
    publisher: &Publisher<O>,
    max_parallelism: usize,
    label: &str,
) -> Result<()>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Processor<I, O> + Clone,
{
    let mut in_flight: JoinSet<(u64, Result<Emitter<O>>)> = JoinSet::new();
    // 已完成但前面還有未完成的輸入
    let mut ready: BTreeMap<u64, Emitter<O>> = BTreeMap::new();
    let mut admitted = 0u64;
    let mut next_publish = 0u64;
    let mut input_open = true;

    while input_open || !in_flight.is_empty() {
        let room = in_flight.len() + ready.len() < max_parallelism;
        tokio::select! {
            biased;
            error = faults.raised() => return Err(error),
            joined = in_flight.join_next(), if !in_flight.is_empty() => {
                let (index, result) = match joined {
                    Some(Ok(done)) => done,
                    Some(Err(e)) => {
                        return Err(PipelineError::StageAborted {
                            stage: label.to_string(),
                            message: panic_message(e),
                        })
                    }
                    None => continue,
                };
                ready.insert(index, result?);
                publish_ready(&mut ready, &mut next_publish, publisher, faults).await?;
            }
            next = input.recv(), if input_open && room => {
                let index = admitted;
                match next {
                    Some(Input::Message(message)) => {
                        admitted += 1;
                        let mut worker = processor.clone();
                        in_flight.spawn(async move {
                            let mut out =
                                Emitter::for_input(message.id(), message.provenance().clone());
                            let result = worker.process(message, &mut out).await.map(|_| out);
                            (index, result)
                        });
                    }
                    Some(Input::Settled(claims)) => {
                        admitted += 1;
                        let mut out = Emitter::detached();
                        processor.settle(claims, &mut out).await?;
                        ready.insert(index, out);
                        publish_ready(&mut ready, &mut next_publish, publisher, faults).await?;
                    }
                    None => input_open = false,
                }
            }
        }
    }
    flush(processor, publisher).await
}

/// 同時處理多則輸入，輸出依輸入順序送出
pub(crate) async fn run_concurrent<I, O, P>(
    mut processor: P,
    mut input: QueueReceiver<Input<I>>,
    mut faults: FaultWatch,
    publisher: Publisher<O>,
    max_parallelism: usize,
    label: Arc<str>,
) -> WorkerExit<O>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Processor<I, O> + Clone,
{
    let outcome = drive_concurrent(
        &mut processor,
        &mut input,
        &mut faults,
        &publisher,
        max_parallelism,
        &label,
    )
    .await;
    (outcome, publisher)
}

pub(crate) fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// 啟動 worker；worker 的 panic 轉成 stage 故障
pub(crate) fn spawn_worker<O, F>(core: Arc<StageCore>, worker: F)
where
    O: Send + 'static,
    F: Future<Output = WorkerExit<O>> + Send + 'static,
{
    tracing::debug!("▶️ Stage '{}' started", core.label());
    let task = tokio::spawn(worker);
    tokio::spawn(async move {
        match task.await {
            Ok((outcome, publisher)) => {
                core.finish(outcome, publisher.has_output());
                // 先記錄結果再關閉輸出，下游看到結尾時一定讀得到結果
                drop(publisher);
            }
            Err(e) => {
                let error = core.aborted(panic_message(e));
                core.finish(Err(error), false);
            }
        }
    });
}
