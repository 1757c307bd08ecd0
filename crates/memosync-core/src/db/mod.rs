//! Local Store: account-scoped persistence for the memo/resource mirror

mod connection;
mod mapping;
mod memo_repository;
mod migrations;
mod resource_repository;
mod store;
mod user_repository;

pub use connection::Database;
pub use memo_repository::{MemoChanges, MemoRepository};
pub use resource_repository::ResourceRepository;
pub use store::{LocalStore, StoreBatch};
pub use user_repository::UserRepository;
