pub mod command;
pub mod control_loop;
pub mod datalog;
pub mod device;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod registry;
pub mod safety;
pub mod sequence;
pub mod sequencer;
pub mod shutdown;
pub mod sync;
pub mod timebase;
pub mod window;

pub use command::{CommandParseError, OperatorCommand};
pub use control_loop::{LoopConfig, LoopStats, Sample, StandEvent, TelemetryLoop, TickReport, TickStatus};
pub use datalog::{Cadence, DataLogger, JsonlSink, MemorySink, SamplingMode, TelemetryRecord, TelemetrySink};
pub use device::{Calibration, Device, DeviceError, DeviceKind, Sensor, SensorKind, Valve};
pub use hal::{HardwareProvider, ProviderError};
#[cfg(feature = "simulation")]
pub use hal_sim::{ChannelLink, SimulatedStand};
pub use registry::{DeviceRegistry, RegistryError};
pub use safety::{RedlineBreach, SafetyMonitor, Verdict};
pub use sequence::{Action, Sequence, SequenceError, SequenceFile, SequenceSource, SequenceStep, StaticSequence};
pub use sequencer::{RunSummary, Sequencer, StepError, StepOutcome, StopReason};
pub use shutdown::{ShutdownController, ShutdownReason, ShutdownReport, ShutdownTargets};
pub use sync::{StandSnapshot, StateExchange};
pub use timebase::TimeBase;
pub use window::RollingWindow;
