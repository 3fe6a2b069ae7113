pub mod api;
pub mod events;
pub mod models;
pub mod permissions;
pub mod time;
