pub mod clock;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod protocol;
pub mod reaper;
pub mod wal;
pub mod wire;
