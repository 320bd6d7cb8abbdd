// crates/translate/src/lib.rs
pub mod batch;
pub mod pump;
pub mod translator;

pub use batch::*;
pub use pump::*;
pub use translator::*;
