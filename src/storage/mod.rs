pub mod block;
pub(crate) mod journal;
pub mod store;
