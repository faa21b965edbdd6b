pub mod api;
pub mod events;
pub mod ident;
pub mod models;
