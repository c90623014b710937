pub mod assignments;
pub mod backup_exchange;
pub mod core;
pub mod follow_up;
pub mod parent_requests;
pub mod teacher_leads;
