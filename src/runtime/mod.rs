/// Workflow runtime
///
/// The engine drives instances through their definition's stages. It leans
/// on the assignee resolver, the action handler registry, the notification
/// gateway and condition evaluation. The sweeper applies stage timeouts in
/// the background.

pub mod actions;
pub mod assignee;
pub mod condition;
pub mod engine;
pub mod notify;
pub mod sweeper;

pub use actions::{ActionHandler, ActionRegistry};
pub use assignee::{AssigneeResolver, Directory, StaticDirectory};
pub use engine::{ActionOptions, CancelOptions, DelegateOptions, StartOptions, WorkflowEngine};
pub use notify::{NotificationGateway, NotificationSink, WorkflowEvent};
pub use sweeper::{SweepReport, SweepScheduler, TimeoutSweeper};
