pub mod errors;
pub mod id;
pub mod time;

pub use errors::{CodeCollabError, ConfigError};
pub use id::{new_id, ParticipantId};
pub use time::now_millis;

pub type Result<T> = std::result::Result<T, CodeCollabError>;
