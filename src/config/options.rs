use crate::core::stage::StageOptions;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 訊息進入被計時的 stage 時呼叫，參數為 stage 名稱
pub type EnterCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// 訊息離開被計時的 stage 時呼叫，參數為 stage 名稱與停留時間
pub type ElapsedCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Builder 的設定。至少設定一個回呼時，`then` 加入的每個 stage 都會被計時
#[derive(Clone, Default)]
pub struct BuilderOptions {
    pub on_enter: Option<EnterCallback>,
    pub on_elapsed: Option<ElapsedCallback>,
    /// 由 builder 建立的 stage 使用的設定
    pub stage: StageOptions,
}

impl BuilderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enter(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Arc::new(callback));
        self
    }

    pub fn on_elapsed(mut self, callback: impl Fn(&str, Duration) + Send + Sync + 'static) -> Self {
        self.on_elapsed = Some(Arc::new(callback));
        self
    }

    pub fn with_stage_options(mut self, stage: StageOptions) -> Self {
        self.stage = stage;
        self
    }

    pub fn is_instrumented(&self) -> bool {
        self.on_enter.is_some() || self.on_elapsed.is_some()
    }

    /// 給 builder 產生的 stage 使用；不沿用固定名稱，避免多個 stage 同名
    pub(crate) fn stage_options(&self) -> StageOptions {
        StageOptions {
            name: None,
            ..self.stage.clone()
        }
    }
}

impl fmt::Debug for BuilderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderOptions")
            .field("on_enter", &self.on_enter.is_some())
            .field("on_elapsed", &self.on_elapsed.is_some())
            .field("stage", &self.stage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrumentation_requires_a_callback() {
        assert!(!BuilderOptions::new().is_instrumented());
        assert!(BuilderOptions::new().on_enter(|_| {}).is_instrumented());
        assert!(BuilderOptions::new()
            .on_elapsed(|_, _| {})
            .is_instrumented());
    }

    #[test]
    fn test_stage_options_drop_fixed_name() {
        let options = BuilderOptions::new()
            .with_stage_options(StageOptions::named("shared").with_parallelism(3));
        let stage = options.stage_options();
        assert_eq!(stage.name, None);
        assert_eq!(stage.max_parallelism, 3);
    }
}
