pub mod requests;

pub use requests::{RequestStore, SelectionMode, StoreError};
