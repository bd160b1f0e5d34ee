pub mod error;
pub mod record;
pub mod types;
pub mod value;

pub use error::{EngineError, Result};
pub use record::EntityRecord;
pub use types::{DataType, EntityKey, Operation, Phase};
pub use value::Value;
