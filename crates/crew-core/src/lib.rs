pub mod errors;
pub mod events;
pub mod ids;
pub mod protocol;
pub mod provider;
pub mod stream;
pub mod tools;
