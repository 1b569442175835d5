pub mod config;
pub mod errors;
pub mod params;
pub mod record;
pub mod result;

pub use config::*;
pub use errors::*;
pub use params::*;
pub use record::*;
pub use result::*;
