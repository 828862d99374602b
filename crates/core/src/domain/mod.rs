pub mod call;
pub mod extraction;
pub mod field;
pub mod session;
