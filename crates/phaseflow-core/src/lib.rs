pub mod config;
pub mod error;
pub mod event;
pub mod handover;
pub mod traits;
pub mod types;

pub use config::{AppConfig, PipelineFile};
pub use error::{PhaseflowError, Result};
pub use event::EventBus;
pub use handover::{HandoverDocument, Phase};
pub use types::*;
