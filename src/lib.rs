pub mod calendar;
pub mod clock;
pub mod collab;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod reaper;
pub mod refund;
pub mod retry;
pub mod settings;
pub mod wal;
pub mod wire;
