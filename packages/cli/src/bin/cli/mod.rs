pub mod files;
pub mod machines;
pub mod monitor;
