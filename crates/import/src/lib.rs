pub mod hash;
pub mod mapping;
pub mod parser;
pub mod value;

pub use hash::{file_digest, row_fingerprint};
pub use mapping::{FieldSpec, FormatMapping, StatementEncoding};
pub use parser::{parse_statement, CanonicalRow, ParseError};
