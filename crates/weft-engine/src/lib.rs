pub mod aggregator;
pub mod dispatcher;
pub mod run_log;
pub mod scheduler;

pub use aggregator::{Closure, PortAggregator};
pub use dispatcher::{Dispatcher, Strategy};
pub use run_log::RunLogger;
pub use scheduler::{GraphScheduler, NodeSummary, RunHandle, RunRecord, RunReport};
