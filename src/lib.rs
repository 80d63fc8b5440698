pub mod conf;
pub mod detectors;
pub mod scheduler;
pub mod structures;
pub mod util;

pub use detectors::{NetworkTester, ProbeError, TestType};
pub use scheduler::{ScheduleError, Scheduler, Task};
pub use structures::ProbeResult;
