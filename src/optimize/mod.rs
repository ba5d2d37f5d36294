//! Optimization core: state model, stage machine, controller, driver, assembly

pub mod assemble;
pub mod controller;
pub mod driver;
pub mod machine;
pub mod progress;
pub mod state;


pub use assemble::{assemble_output, default_output_path, summarize, write_artifact, Summary};
pub use controller::Controller;
pub use driver::{Driver, RunOutcome};
pub use progress::{Observer, ProgressEvent};
pub use state::{
    EndReason, FunctionOutcome, FunctionResult, FunctionResults, FunctionUnit, RunContext,
    RunSettings,
};
