pub mod conf;
pub mod error;

pub use conf::BuilderOptions;
pub use error::{McPlusError, McResult, fatal, not_implemented};
