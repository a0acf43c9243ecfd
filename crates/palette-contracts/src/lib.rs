pub mod events;
pub mod gallery;
pub mod models;
pub mod styles;
