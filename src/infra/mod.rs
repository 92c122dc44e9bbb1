mod audit_log;
mod settings;
mod supervisor;

pub use audit_log::*;
pub use settings::*;
pub use supervisor::*;
