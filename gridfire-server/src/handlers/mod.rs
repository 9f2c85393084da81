pub mod events;
pub mod health;
pub mod stream;
pub mod tracks;
pub mod upload;
