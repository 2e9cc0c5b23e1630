pub mod attendance;
pub mod classes;
pub mod core;
pub mod sections;
pub mod students;
