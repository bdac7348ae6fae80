pub mod connection;
pub mod in_memory;
pub mod mongo;
pub mod store;

pub use in_memory::InMemoryTransactionStore;
pub use mongo::MongoTransactionStore;
pub use store::TransactionStore;
