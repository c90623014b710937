pub mod alloc;
pub mod backup;
pub mod db;
pub mod dedup;
pub mod follow_up;
pub mod ids;
pub mod ipc;
