use crate::config::options::{BuilderOptions, ElapsedCallback, EnterCallback};
use crate::core::blocks::Block;
use crate::core::completion::Completion;
use crate::core::ledger::{CorrelationLedger, LedgerEntry};
use crate::core::stage::{Emitter, Processor, StageOptions};
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus, Provenance};
use crate::domain::ports::{Link, Propagator, Source, Stage, Target};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// 包住一個 stage，量測每則訊息在其中停留的時間
///
/// 輸入端為每則訊息登記新的序號並以序號取代識別碼後轉送給內部 stage；
/// 內部 stage 之後接一個轉送用的 tap，依輸出的 `Provenance` 找回登記資料、
/// 回報經過時間並還原原本的識別碼與 provenance。payload 與順序都不受影響。
pub struct TimingInterceptor<I, O> {
    label: Arc<str>,
    inner_label: Arc<str>,
    inner: Arc<dyn Target<I>>,
    tap: Arc<Block<O, O>>,
    ledger: Arc<CorrelationLedger>,
    on_enter: Option<EnterCallback>,
    _link: Link,
}

impl<I: Send + 'static, O: Send + 'static> TimingInterceptor<I, O> {
    pub fn wrap<S>(stage: Arc<S>, options: &BuilderOptions) -> Self
    where
        S: Propagator<I, O> + 'static,
    {
        let inner_label: Arc<str> = Arc::from(stage.label());
        let ledger = Arc::new(CorrelationLedger::new());
        let tap_label = format!("timing-tap({})", inner_label);
        let processor = Elapsed {
            label: inner_label.clone(),
            tap_label: Arc::from(tap_label.as_str()),
            ledger: ledger.clone(),
            on_elapsed: options.on_elapsed.clone(),
        };
        let tap = Arc::new(Block::new(processor, StageOptions::named(tap_label)));
        let tap_target: Arc<dyn Target<O>> = tap.clone();
        let link = stage.link_to(tap_target, LinkOptions::propagate());

        tracing::debug!("⏱️ Timing stage '{}'", inner_label);
        Self {
            label: Arc::from(format!("timing({})", inner_label)),
            inner_label,
            inner: stage,
            tap,
            ledger,
            on_enter: options.on_enter.clone(),
            _link: link,
        }
    }

    pub fn ledger(&self) -> &Arc<CorrelationLedger> {
        &self.ledger
    }

    fn admit(&self, message: Envelope<I>) -> (MessageId, Envelope<I>) {
        let (origin, provenance, payload) = message.into_parts();
        let seq = self.ledger.admit(origin, provenance);
        if let Some(on_enter) = &self.on_enter {
            on_enter(&self.inner_label);
        }
        (seq, Envelope::new(seq, payload))
    }

    /// 未被接受的訊息：撤銷登記並還原識別碼
    fn refused(&self, seq: MessageId, status: OfferStatus<I>) -> OfferStatus<I> {
        let restore = |message: Envelope<I>| {
            let entry = self.ledger.settle(seq);
            Envelope::with_provenance(entry.origin, entry.provenance, message.into_payload())
        };
        match status {
            OfferStatus::Accepted => OfferStatus::Accepted,
            OfferStatus::Declined(message) => OfferStatus::Declined(restore(message)),
            OfferStatus::Postponed(message) => OfferStatus::Postponed(restore(message)),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> Stage for TimingInterceptor<I, O> {
    fn label(&self) -> &str {
        &self.label
    }

    fn completion(&self) -> Completion {
        self.tap.completion()
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Target<I> for TimingInterceptor<I, O> {
    async fn offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        let (seq, message) = self.admit(message);
        let status = self.inner.offer(message).await;
        self.refused(seq, status)
    }

    fn try_offer(&self, message: Envelope<I>) -> OfferStatus<I> {
        let (seq, message) = self.admit(message);
        let status = self.inner.try_offer(message);
        self.refused(seq, status)
    }

    /// 上游已消化的輸入也換成序號穿過內部 stage，由 tap 還原後繼續往下游
    async fn settle(&self, claims: Vec<Claim>) {
        let carried: Vec<Claim> = claims
            .into_iter()
            .map(|claim| {
                let seq = self
                    .ledger
                    .admit(claim.id, Provenance::Split { last: claim.last });
                Claim::new(seq, true)
            })
            .collect();
        self.inner.settle(carried).await;
    }

    fn complete(&self) {
        self.inner.complete();
    }

    fn fault(&self, error: PipelineError) {
        self.inner.fault(error);
    }
}

#[async_trait]
impl<I: Send + 'static, O: Send + 'static> Source<O> for TimingInterceptor<I, O> {
    fn link_to(&self, target: Arc<dyn Target<O>>, options: LinkOptions) -> Link {
        self.tap.link_to(target, options)
    }

    async fn receive(&self) -> Option<Envelope<O>> {
        self.tap.receive().await
    }

    async fn reserve(&self) -> Option<MessageId> {
        self.tap.reserve().await
    }

    fn consume(&self, id: MessageId) -> Option<Envelope<O>> {
        self.tap.consume(id)
    }

    fn release(&self, id: MessageId) -> bool {
        self.tap.release(id)
    }
}

/// 同一序號只保留一個 claim；任一個是最後一則就算最後一則
fn absorb(claims: &mut Vec<Claim>, claim: Claim) {
    match claims.iter_mut().find(|c| c.id == claim.id) {
        Some(existing) => existing.last |= claim.last,
        None => claims.push(claim),
    }
}

/// tap 的處理器：回報時間並還原識別碼
struct Elapsed {
    label: Arc<str>,
    tap_label: Arc<str>,
    ledger: Arc<CorrelationLedger>,
    on_elapsed: Option<ElapsedCallback>,
}

impl Elapsed {
    fn lookup(&self, claim: Claim) -> LedgerEntry {
        if claim.last {
            self.ledger.settle(claim.id)
        } else {
            self.ledger.peek(claim.id)
        }
    }
}

#[async_trait]
impl<O: Send + 'static> Processor<O, O> for Elapsed {
    async fn process(&mut self, input: Envelope<O>, out: &mut Emitter<O>) -> Result<()> {
        let (seq, provenance, payload) = input.into_parts();
        let mut claims = Vec::new();
        for claim in provenance.claims(seq) {
            absorb(&mut claims, claim);
        }
        // 沒有對應輸入的輸出不計時
        if claims.is_empty() {
            out.forward(Envelope::with_provenance(seq, provenance, payload));
            return Ok(());
        }

        let entries: Vec<(LedgerEntry, bool)> = claims
            .iter()
            .map(|claim| (self.lookup(*claim), claim.last))
            .collect();
        let started = entries.iter().map(|(entry, _)| entry.started).min();

        let envelope = match &entries[..] {
            [(entry, last)] => {
                Envelope::with_provenance(entry.origin, entry.restored(*last), payload)
            }
            _ => {
                let mut sources = Vec::new();
                for (entry, last) in &entries {
                    for claim in entry.restored(*last).claims(entry.origin) {
                        absorb(&mut sources, claim);
                    }
                }
                let origin = entries.last().map(|(entry, _)| entry.origin).unwrap_or(seq);
                Envelope::with_provenance(origin, Provenance::Merged(sources), payload)
            }
        };

        if let (Some(started), Some(on_elapsed)) = (started, &self.on_elapsed) {
            on_elapsed(&self.label, started.elapsed());
        }
        out.forward(envelope);
        Ok(())
    }

    /// 被過濾掉的輸入：移除登記，不回報時間，原本的 claim 繼續往下游
    async fn settle(&mut self, claims: Vec<Claim>, out: &mut Emitter<O>) -> Result<()> {
        let mut restored = Vec::new();
        for claim in claims.into_iter().filter(|claim| claim.last) {
            let Some(entry) = self.ledger.try_settle(claim.id) else {
                return Err(PipelineError::StageAborted {
                    stage: self.tap_label.to_string(),
                    message: format!("no ledger entry for settled message {}", claim.id),
                });
            };
            restored.extend(entry.provenance.claims(entry.origin));
        }
        out.settle(restored);
        Ok(())
    }
}
