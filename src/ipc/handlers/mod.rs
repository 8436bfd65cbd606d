pub mod attendance;
pub mod auth;
pub mod classes;
pub mod core;
pub mod faculty;
pub mod me;
pub mod reports;
pub mod setup;
pub mod students;
pub mod substitutions;
pub mod timetable;
