pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use crate::config::CliConfig;
pub use crate::config::{BuilderOptions, PipelineConfig};

pub use crate::core::{
    Block, BroadcastBlock, Builder, Capacity, Completion, CorrelationLedger, Emitter,
    ForkCombinator, JoinBlock, JoinMode, PipelineBuilder, PipelineHandle, Processor, SinkBlock,
    StageOptions, TerminalHandle, TimingInterceptor,
};
pub use crate::domain::model::{Claim, Envelope, LinkOptions, MessageId, OfferStatus, Provenance};
pub use crate::domain::ports::{Link, Propagator, Source, Stage, Target};
pub use crate::utils::error::{ErrorCategory, PipelineError, Result};
pub use crate::utils::monitor::TimingMonitor;
