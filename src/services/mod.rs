pub mod compositor;
pub mod image;
pub mod retry;
pub mod script;
pub mod setup;
pub mod speech;
pub mod vault;
pub mod workflow;
