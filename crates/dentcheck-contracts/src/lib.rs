pub mod assessment;
pub mod cache;
pub mod error;
pub mod events;
pub mod vocab;
