pub mod clock;
pub mod sync;
pub mod timer;

pub use clock::{Clock, TimerHandle};
pub use sync::{SyncEngine, SyncError, SyncPolicy, SyncReport, SyncTarget};
pub use timer::{
    diff_ms, to_nanos, FrameStats, FrameTimes, HighPrecisionTimer, Nanos, SharedTimer,
    SimulatedTimer, Timer,
};
