pub mod registration_store;

pub use registration_store::{CourseTxn, RegistrationStore, StoreError, TxnOp};

#[cfg(any(test, feature = "testing"))]
pub use registration_store::MockRegistrationStore;
