pub mod chat;
pub mod messages;
pub mod models;
pub mod root;
pub mod status;
