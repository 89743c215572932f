//! Raw session discovery and classification.
//!
//! A session root is classified from the files present:
//! - `raw_behavior_data/_iblrig_taskSettings.raw.json` names the rig protocol
//! - `raw_ephys_data/<probe>/*.ap.meta` marks an electrophysiology recording
//! - `raw_passive_data/` and `raw_opto_data/` mark optional stimulus blocks
//!
//! ```rust,ignore
//! use neuropipe::session::SessionLocator;
//!
//! let classification = SessionLocator::new().classify(root)?;
//! println!("{} is a {} session", classification.session, classification.family);
//! ```

pub mod layout;
pub mod locator;
pub mod spikeglx;
pub mod types;

pub use locator::{read_probe_insertions, ProbeInsertion, SessionLocator, ACQUISITION_ONLY_PROTOCOL};
pub use spikeglx::ProbeMeta;
pub use types::{Procedure, ProtocolFamily, Session, SessionClassification};
