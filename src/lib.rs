pub mod ack;
pub mod discord;
pub mod error;
pub mod janitor;
pub mod models;
pub mod ordering;
pub mod player;
pub mod registry;
pub mod render;
pub mod store;
pub mod transaction;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;
