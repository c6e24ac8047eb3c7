pub mod error;
pub mod types;

pub use error::{CommonError, CommonResult};
pub use types::*;
