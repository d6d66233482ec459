pub mod conversation;
pub mod execution;
pub mod session;
