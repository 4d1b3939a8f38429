pub mod labjack;
pub mod metrics;

pub use labjack::{analog_register, decode_f32, digital_register, LabJackModbus};
pub use metrics::{init_metrics, render, serve_metrics};
