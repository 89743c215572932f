//! Clock synchronization.
//!
//! Every acquisition device records shared fiducial pulses on its own clock.
//! The synchronizer matches each device's pulses against the reference
//! stream (the acquisition box on ephys rigs) and fits a strictly increasing
//! [`SyncMapping`] from local time to reference time.
//!
//! ```rust,ignore
//! use neuropipe::sync::{ClockStream, ClockSynchronizer, DeviceKind, SyncConfig, SyncSource};
//!
//! let reference = ClockStream::new("nidq", DeviceKind::AcquisitionBox, nidq_pulses);
//! let bpod = ClockStream::new("bpod", DeviceKind::BehaviorController, bpod_pulses);
//! let outcome = ClockSynchronizer::new(SyncConfig::default())
//!     .synchronize(&reference, &[SyncSource::new(bpod)])?;
//! let trial_starts = outcome.mapping("bpod")?.map_all(&bpod_trial_starts);
//! ```

pub mod mapping;
pub mod matching;
pub mod resample;
pub mod stream;
pub mod synchronizer;

pub use mapping::{FitModel, MappingSegment, SegmentModel, SyncMapping, SyncQuality};
pub use matching::MatchedPairs;
pub use resample::{resample, Fill, Interpolation, ResampleError, Resampled, TimeSeries};
pub use stream::{ClockStream, DeviceKind, SyncSource};
pub use synchronizer::{ClockSynchronizer, DeviceSyncPolicy, SyncConfig, SyncOutcome};
