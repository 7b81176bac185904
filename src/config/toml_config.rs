use crate::config::options::BuilderOptions;
use crate::core::queue::Capacity;
use crate::core::stage::StageOptions;
use crate::utils::error::{PipelineError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 從 TOML 載入的 pipeline 設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub stage: StageOptions,
    pub instrumentation: Option<InstrumentationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    pub enabled: bool,
    /// 每則訊息進入 stage 時也記錄一筆
    pub log_entries: Option<bool>,
    /// 超過此時間的停留以 warn 記錄
    pub slow_stage_ms: Option<u64>,
}

impl PipelineConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| PipelineError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${PIPELINE_NAME})；未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| PipelineError::ConfigError {
            message: e.to_string(),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn instrumentation_enabled(&self) -> bool {
        self.instrumentation.as_ref().map(|i| i.enabled).unwrap_or(false)
    }

    pub fn slow_stage_threshold(&self) -> Option<Duration> {
        self.instrumentation
            .as_ref()
            .and_then(|i| i.slow_stage_ms)
            .map(Duration::from_millis)
    }

    /// 轉成 builder 設定；啟用計時時回呼透過 tracing 記錄
    pub fn builder_options(&self) -> BuilderOptions {
        let options = BuilderOptions::new().with_stage_options(self.stage.clone());
        let Some(instrumentation) = self.instrumentation.as_ref().filter(|i| i.enabled) else {
            return options;
        };

        let slow = self.slow_stage_threshold();
        let options = options.on_elapsed(move |label, elapsed| match slow {
            Some(threshold) if elapsed >= threshold => {
                tracing::warn!("🐢 Stage '{}' took {:?} (threshold {:?})", label, elapsed, threshold)
            }
            _ => tracing::debug!("⏱️ Stage '{}' took {:?}", label, elapsed),
        });

        if instrumentation.log_entries.unwrap_or(false) {
            options.on_enter(|label| tracing::trace!("➡️ Message entered '{}'", label))
        } else {
            options
        }
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_non_empty_string("pipeline.name", &self.pipeline.name)?;
        validation::validate_positive_number(
            "stage.max_parallelism",
            self.stage.max_parallelism,
            1,
        )?;

        if let Capacity::Bounded(size) = self.stage.capacity {
            validation::validate_positive_number("stage.capacity", size, 1)?;
        }

        if let Some(ms) = self.instrumentation.as_ref().and_then(|i| i.slow_stage_ms) {
            validation::validate_range("instrumentation.slow_stage_ms", ms, 1, 3_600_000)?;
        }

        Ok(())
    }
}
