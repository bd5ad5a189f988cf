pub mod config;
pub mod errors;
pub mod outcome;
pub mod point;
pub mod record;
pub mod run;

pub use config::*;
pub use errors::*;
pub use outcome::*;
pub use point::*;
pub use record::*;
pub use run::*;
