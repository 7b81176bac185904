use clap::Parser;
use dataflow_pipeline::utils::{logger, validation::Validate};
use dataflow_pipeline::{
    Builder, BuilderOptions, CliConfig, ErrorCategory, PipelineConfig, PipelineError,
    TimingMonitor,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: u64,
    name: String,
    value: i64,
}

fn generate_records(count: usize) -> Vec<serde_json::Value> {
    (0..count as u64)
        .map(|id| {
            serde_json::json!({
                "id": id,
                "name": format!("item-{:04}", id),
                "value": (id * 37 % 101) as i64 - 50,
            })
        })
        .collect()
}

fn load_options(config: &CliConfig) -> Result<(String, BuilderOptions), PipelineError> {
    match &config.config {
        Some(path) => {
            let pipeline_config = PipelineConfig::from_file(path)?;
            pipeline_config.validate()?;
            tracing::info!("📄 Loaded pipeline config '{}'", pipeline_config.name());
            Ok((
                pipeline_config.name().to_string(),
                pipeline_config.builder_options(),
            ))
        }
        None => Ok(("demo".to_string(), BuilderOptions::new())),
    }
}

async fn run(config: &CliConfig, monitor: &TimingMonitor) -> Result<(), PipelineError> {
    let (name, options) = load_options(config)?;
    let options = monitor.instrument(options);

    tracing::info!(
        "🚀 Running pipeline '{}' over {} record(s), batch size {}",
        name,
        config.records,
        config.batch_size
    );

    let handle = Builder::with_options(options)
        .from_iter(generate_records(config.records))
        .select_async(|raw| async move { serde_json::from_value::<Record>(raw) })
        .fork()
        .then(
            |records| records.select(|record| record.name),
            |records| records.select(|record| record.value),
        )
        .batch(config.batch_size)
        .end();

    let batches = handle.receive_all().await?;
    let pairs: usize = batches.iter().map(Vec::len).sum();
    let total: i64 = batches
        .iter()
        .flat_map(|batch| batch.iter().map(|(_, value)| *value))
        .sum();

    monitor.log_stats("Pipeline");
    tracing::info!(
        "✅ Pipeline '{}' produced {} batch(es), {} pair(s), value total {}",
        name,
        batches.len(),
        pairs,
        total
    );
    if let Some((first_name, first_value)) = batches.first().and_then(|b| b.first()) {
        tracing::debug!("First pair: ({}, {})", first_name, first_value);
    }
    println!(
        "✅ {} batch(es), {} pair(s), value total {}",
        batches.len(),
        pairs,
        total
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();

    // 初始化日誌
    if config.json_logs {
        logger::init_json_logger(config.verbose);
    } else {
        logger::init_cli_logger(config.verbose);
    }

    tracing::info!("Starting dataflow-pipeline demo");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e);
        std::process::exit(2);
    }

    let monitor = TimingMonitor::new(config.timings);
    if monitor.is_enabled() {
        tracing::info!("⏱️ Stage timing enabled");
    }

    if let Err(e) = run(&config, &monitor).await {
        tracing::error!("❌ Pipeline failed: {} (Category: {:?})", e, e.category());
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e);
        eprintln!("💡 {}", e.recovery_suggestion());

        // 依錯誤類別決定退出碼
        let exit_code = match e.category() {
            ErrorCategory::Propagated => 1,
            ErrorCategory::Configuration => 2,
            ErrorCategory::Io => 3,
            ErrorCategory::ProgrammerError => 4,
        };
        std::process::exit(exit_code);
    }

    monitor.log_final_stats();
    Ok(())
}
