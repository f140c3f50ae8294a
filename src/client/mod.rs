mod analyzer;
mod coordinator;
mod endpoint;
mod results;

pub use analyzer::*;
pub use coordinator::*;
pub use endpoint::*;
pub use results::*;
