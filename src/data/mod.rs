pub mod builder;
pub mod covariate;
pub mod event;
pub mod parser;
pub mod structs;

pub use covariate::*;
pub use event::*;
pub use structs::{Occasion, Subject};
