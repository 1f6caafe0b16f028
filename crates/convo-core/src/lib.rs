pub mod api;
pub mod errors;
pub mod events;
pub mod frames;
pub mod ids;
pub mod model;
