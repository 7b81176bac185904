use crate::core::blocks::Block;
use crate::core::completion::Completion;
use crate::core::outlet::Publisher;
use crate::core::queue::QueueReceiver;
use crate::core::stage::{
    lock, spawn_worker, FaultSignal, FaultWatch, Inbox, Input, StageCore, StageOptions,
    WorkerExit,
};
use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus};
use crate::domain::ports::{Link, Source, Stage, Target};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;

/// 把每則輸入複製給所有已連結的下游
///
/// 尚未有任何連結時，輸入會留在佇列中等待第一個連結。
pub struct BroadcastBlock<T> {
    core: Arc<StageCore>,
    inbox: Inbox<T>,
    links: Arc<LinkRegistry<T>>,
    tap: OnceLock<Arc<Block<T, T>>>,
}

struct LinkRegistry<T> {
    state: Mutex<RegistryState<T>>,
    changed: Notify,
}

struct RegistryState<T> {
    next_key: u64,
    targets: Vec<Registered<T>>,
    closed: Option<Result<()>>,
}

struct Registered<T> {
    key: u64,
    target: Arc<dyn Target<T>>,
    options: LinkOptions,
}

fn propagate<T: Send + 'static>(target: &Arc<dyn Target<T>>, outcome: &Result<()>) {
    match outcome {
        Ok(()) => target.complete(),
        Err(error) => target.fault(error.clone()),
    }
}

impl<T: Send + 'static> LinkRegistry<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                next_key: 0,
                targets: Vec::new(),
                closed: None,
            }),
            changed: Notify::new(),
        })
    }

    fn add(self: &Arc<Self>, target: Arc<dyn Target<T>>, options: LinkOptions) -> Link {
        let mut state = lock(&self.state);
        if let Some(outcome) = state.closed.clone() {
            drop(state);
            if options.propagate_completion {
                propagate(&target, &outcome);
            }
            return Link::new(|| {});
        }

        let key = state.next_key;
        state.next_key += 1;
        state.targets.push(Registered {
            key,
            target,
            options,
        });
        drop(state);
        self.changed.notify_waiters();

        let registry = Arc::clone(self);
        Link::new(move || registry.remove(key))
    }

    fn remove(&self, key: u64) {
        lock(&self.state).targets.retain(|r| r.key != key);
    }

    fn snapshot(&self) -> Vec<(u64, Arc<dyn Target<T>>)> {
        lock(&self.state)
            .targets
            .iter()
            .map(|r| (r.key, r.target.clone()))
            .collect()
    }

    async fn wait_for_targets(&self) -> Vec<(u64, Arc<dyn Target<T>>)> {
        loop {
            let notified = self.changed.notified();
            let targets = self.snapshot();
            if !targets.is_empty() {
                return targets;
            }
            notified.await;
        }
    }

    fn close(&self, outcome: &Result<()>) {
        let targets = {
            let mut state = lock(&self.state);
            state.closed = Some(outcome.clone());
            std::mem::take(&mut state.targets)
        };
        for registered in targets {
            if registered.options.propagate_completion {
                propagate(&registered.target, outcome);
            }
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastBlock<T> {
    pub fn new(options: StageOptions) -> Self {
        let label = options.label_for("broadcast");
        let core = StageCore::new(label.clone());
        let faults = FaultSignal::new();
        let watch = faults.watch();
        let (inbox, input) = Inbox::new(label, options.capacity, faults);
        let links = LinkRegistry::new();

        spawn_worker(core.clone(), run_broadcast(links.clone(), input, watch));
        Self {
            core,
            inbox,
            links,
            tap: OnceLock::new(),
        }
    }

    pub async fn send(&self, payload: T) -> Result<()> {
        self.inbox.send(payload).await
    }

    /// 拉取模式用的緩衝連結，第一次拉取時建立
    fn tap(&self) -> &Arc<Block<T, T>> {
        self.tap.get_or_init(|| {
            let buffer = Arc::new(Block::buffer(StageOptions::named(format!(
                "{}.pull",
                self.core.label()
            ))));
            let _ = self.links.add(buffer.clone(), LinkOptions::propagate());
            buffer
        })
    }
}

async fn deliver<T: Clone + Send + 'static>(
    links: &LinkRegistry<T>,
    message: Envelope<T>,
) {
    let targets = links.wait_for_targets().await;
    for (key, target) in targets {
        match target.offer(message.clone()).await {
            OfferStatus::Accepted => {}
            OfferStatus::Declined(_) | OfferStatus::Postponed(_) => {
                tracing::debug!("↩️ '{}' stopped accepting broadcasts", target.label());
                links.remove(key);
            }
        }
    }
}

/// 已消化的輸入只需回報一次，交給第一個下游
async fn settle_first<T: Clone + Send + 'static>(links: &LinkRegistry<T>, claims: Vec<Claim>) {
    let targets = links.wait_for_targets().await;
    if let Some((_, target)) = targets.first() {
        target.settle(claims).await;
    }
}

async fn broadcast_all<T: Clone + Send + 'static>(
    links: &LinkRegistry<T>,
    input: &mut QueueReceiver<Input<T>>,
    faults: &mut FaultWatch,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            error = faults.raised() => return Err(error),
            next = input.recv() => next,
        };
        match next {
            Some(Input::Message(message)) => tokio::select! {
                biased;
                error = faults.raised() => return Err(error),
                _ = deliver(links, message) => {}
            },
            Some(Input::Settled(claims)) => tokio::select! {
                biased;
                error = faults.raised() => return Err(error),
                _ = settle_first(links, claims) => {}
            },
            None => return Ok(()),
        }
    }
}

async fn run_broadcast<T: Clone + Send + 'static>(
    links: Arc<LinkRegistry<T>>,
    mut input: QueueReceiver<Input<T>>,
    mut faults: FaultWatch,
) -> WorkerExit<()> {
    let outcome = broadcast_all(&links, &mut input, &mut faults).await;
    links.close(&outcome);
    (outcome, Publisher::discard())
}

impl<T: Clone + Send + 'static> Stage for BroadcastBlock<T> {
    fn label(&self) -> &str {
        self.core.label()
    }

    fn completion(&self) -> Completion {
        self.core.completion()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Target<T> for BroadcastBlock<T> {
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

    fn fault(&self, error: PipelineError) {
        self.inbox.fault(error);
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Source<T> for BroadcastBlock<T> {
    fn link_to(&self, target: Arc<dyn Target<T>>, options: LinkOptions) -> Link {
        tracing::trace!("🔗 Linked '{}' -> '{}'", self.core.label(), target.label());
        self.links.add(target, options)
    }

    async fn receive(&self) -> Option<Envelope<T>> {
        self.tap().receive().await
    }

    async fn reserve(&self) -> Option<MessageId> {
        self.tap().reserve().await
    }

    fn consume(&self, id: MessageId) -> Option<Envelope<T>> {
        self.tap().consume(id)
    }

    fn release(&self, id: MessageId) -> bool {
        self.tap().release(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_target_sees_every_message() {
        let broadcast = BroadcastBlock::<u32>::new(StageOptions::default());
        let a = Arc::new(Block::<u32, u32>::buffer(StageOptions::default()));
        let b = Arc::new(Block::<u32, u32>::buffer(StageOptions::default()));
        let _ = broadcast.link_to(a.clone(), LinkOptions::propagate());
        let _ = broadcast.link_to(b.clone(), LinkOptions::propagate());

        for i in 0..3 {
            broadcast.send(i).await.unwrap();
        }
        broadcast.complete();

        for target in [a, b] {
            let mut seen = Vec::new();
            while let Some(message) = target.receive().await {
                seen.push(message.into_payload());
            }
            assert_eq!(seen, vec![0, 1, 2]);
            target.completion().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_late_link_receives_completion() {
        let broadcast = BroadcastBlock::<u32>::new(StageOptions::default());
        broadcast.fault(PipelineError::faulted("upstream"));
        assert!(broadcast.completion().await.is_err());

        let late = Arc::new(Block::<u32, u32>::buffer(StageOptions::default()));
        let _ = broadcast.link_to(late.clone(), LinkOptions::propagate());
        assert!(late.completion().await.is_err());
    }

    #[tokio::test]
    async fn test_pull_receives_broadcast() {
        let broadcast = BroadcastBlock::new(StageOptions::default());
        broadcast.send("x").await.unwrap();
        broadcast.complete();
        assert_eq!(broadcast.receive().await.map(Envelope::into_payload), Some("x"));
        assert!(broadcast.receive().await.is_none());
    }
}
