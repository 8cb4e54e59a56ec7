pub mod client;
pub mod events;
pub mod models;
pub mod realtime;

pub use client::ApiClient;
pub use realtime::RealtimeClient;
