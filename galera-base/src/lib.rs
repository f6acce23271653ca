mod error;

pub use error::{err, err_kind, Error, ErrorKind, Result};
