pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod plugin;
pub mod query;
pub mod sink;
pub mod storage;
pub mod collector;
pub mod scheduler;
pub mod coordinator;

pub use collector::{CollectReport, CollectState, CollectorSettings, FragmentCollector};
pub use config::{CuratorConfig, Endpoint};
pub use coordinator::Coordinator;
pub use error::{CuratorError, CuratorResult};
pub use scheduler::Scheduler;

// Test-only printing helper: prints to stderr in test and debug builds, a no-op otherwise.
// Usage in tests: tprintln!("report: {:?}", report);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        if false { let _ = format!($($arg)*); }
    });
}
