pub mod commands;
pub mod console;
pub mod credentials;
pub mod path;
pub mod progress;
pub mod session;
pub mod size;
