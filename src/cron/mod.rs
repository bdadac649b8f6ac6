pub mod runner;
pub mod schedule;

pub use runner::{HandlerFuture, ScheduleEntry, ScheduleHandler, Scheduler};
pub use schedule::{next_occurrence, normalize_expression, validate_expression};
