pub mod error;
pub mod value;

pub use error::{DbError, Result};
pub use value::{DataType, Value};
