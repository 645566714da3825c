pub mod errors;
pub mod models;
pub mod protocol;

pub use errors::*;
pub use models::*;
