pub mod chat;
pub mod promise;
pub mod settings;
pub mod thread;
