pub mod core;
pub mod reports;
pub mod users;
