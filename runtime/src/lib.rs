pub mod helper;
mod logger;
mod rt;

pub use logger::Logger;
pub use rt::*;
