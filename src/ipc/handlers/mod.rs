pub mod backup;
pub mod core;
pub mod enrollments;
pub mod sessions;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod timetable;
