pub mod blocks;
pub mod broadcast;
pub mod builder;
pub mod completion;
pub mod extensions;
pub mod fork;
pub mod handle;
pub mod interceptor;
pub mod join;
pub mod ledger;
pub(crate) mod outlet;
pub mod queue;
pub mod stage;

pub use blocks::{Block, SinkBlock};
pub use broadcast::BroadcastBlock;
pub use builder::{Builder, PipelineBuilder, TerminalHandle};
pub use completion::Completion;
pub use fork::ForkCombinator;
pub use handle::PipelineHandle;
pub use interceptor::TimingInterceptor;
pub use join::{JoinBlock, JoinHalf, JoinMode};
pub use ledger::{CorrelationLedger, LedgerEntry};
pub use queue::Capacity;
pub use stage::{Emitter, Processor, StageOptions};
