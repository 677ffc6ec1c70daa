//! Domain model module declarations.

pub mod machine;
pub mod session;
