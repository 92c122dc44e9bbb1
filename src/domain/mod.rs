mod env;
mod eval_summary;
mod line_buffer;
mod presets;
mod progress;
mod rate;
mod session;
mod snapshot;

pub use env::*;
pub use eval_summary::*;
pub use line_buffer::*;
pub use presets::*;
pub use progress::*;
pub use rate::*;
pub use session::*;
pub use snapshot::*;
