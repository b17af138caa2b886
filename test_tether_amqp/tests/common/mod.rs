pub mod inbox;
pub mod names;
pub mod setup;
pub mod wait;
