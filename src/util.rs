pub mod audio;
pub mod telemetry;
