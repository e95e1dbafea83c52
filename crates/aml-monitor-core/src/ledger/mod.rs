pub mod account;
pub mod store;
pub mod transaction;

pub use account::Account;
pub use store::{AccountWindow, IngestReceipt, StoreSnapshot, TimeWindow, TransactionStore};
pub use transaction::{OriginMetadata, Party, Transaction, TransactionType};
