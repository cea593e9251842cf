pub mod events;
pub mod progress;
pub mod tasks;
