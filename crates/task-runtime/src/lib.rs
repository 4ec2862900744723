pub mod context;
pub mod endpoint;
pub mod engine;
pub mod notifier;
pub mod output;
pub mod supervisor;
pub mod usage;
pub mod watchdog;

#[cfg(test)]
mod test_utils;

pub use context::{
    profile_dir_name, ActiveRequestInfo, ActiveRequests, ProfileRemoval, RequestContext,
    RequestLease,
};
pub use endpoint::{Acknowledgement, TaskEndpoint, ACKNOWLEDGEMENT};
pub use engine::{
    AgentEngine, AgentEngineFactory, EngineRequest, EngineSinks, Environment,
    EnvironmentLauncher, LaunchOptions,
};
pub use notifier::{NotificationSink, ProgressNotifier};
pub use supervisor::{
    CleanupReport, ReleaseStatus, SupervisorSettings, TaskOutcome, TaskReport, TaskSupervisor,
};
pub use usage::total_usage;
pub use watchdog::TimeBudgetWatchdog;
