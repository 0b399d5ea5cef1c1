pub mod assessments;
pub mod backup_exchange;
pub mod bases;
pub mod core;
pub mod groups;
pub mod participants;
pub mod results;
pub mod scores;
pub mod setup;
