use crate::utils::error::{PipelineError, Result};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

type Outcome = Option<Result<()>>;

/// 可被多方等待的完成狀態
#[derive(Clone)]
pub struct Completion {
    label: Arc<str>,
    rx: watch::Receiver<Outcome>,
}

impl Completion {
    /// 等待完成；失敗時回傳造成故障的錯誤
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(PipelineError::StageAborted {
                stage: self.label.to_string(),
                message: "stage was dropped before completing".to_string(),
            })
        })
    }

    pub fn is_completed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// 已完成時的結果
    pub fn outcome(&self) -> Option<Result<()>> {
        self.rx.borrow().clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("label", &self.label)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl IntoFuture for Completion {
    type Output = Result<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

/// 完成狀態的寫入端；只有第一次 `resolve` 生效
pub(crate) struct CompletionSource {
    label: Arc<str>,
    tx: watch::Sender<Outcome>,
}

impl CompletionSource {
    pub(crate) fn new(label: Arc<str>) -> Self {
        let (tx, _) = watch::channel(None);
        Self { label, tx }
    }

    pub(crate) fn completion(&self) -> Completion {
        Completion {
            label: self.label.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn resolve(&self, outcome: Result<()>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        })
    }

    pub(crate) fn outcome(&self) -> Outcome {
        self.tx.borrow().clone()
    }
}
