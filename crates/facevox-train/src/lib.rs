//! # Facevox-Train
//!
//! Adversarial training of the volume generator against the discriminator.
//!
//! ## Components
//!
//! 1. **Loss options**: the tagged set of flags (`wass`, `GP`, `recon`,
//!    `reconL1`, `dist`) and the pure loss-composition step
//! 2. **History**: per-batch, per-epoch and per-run metric columns with a
//!    schema fixed by the loss options
//! 3. **Gate**: withholds discriminator updates while its trailing accuracy
//!    is too high
//! 4. **Orchestrator**: the per-batch state machine, checkpointing every epoch
//!
//! ## Batch Flow
//!
//! ```text
//! DataSource::batch
//!     ↓
//! [UpdateDiscriminator × n_critic]   real + detached fake (+ penalty), gated step
//!     ↓
//! [UpdateGenerator × n_gen]          fake on the true code, always steps
//!     ↓
//! Logged → continue | Checkpoint | Done
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod gate;
pub mod history;
pub mod options;
pub mod orchestrator;
pub mod telemetry;

pub use checkpoint::*;
pub use self::config::*;
pub use data::*;
pub use gate::*;
pub use history::*;
pub use options::*;
pub use orchestrator::*;
pub use telemetry::{init_tracing, InitError};
