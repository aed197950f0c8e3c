pub mod calendar;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod housekeeping;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod tenant;
pub mod wal;
