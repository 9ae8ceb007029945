pub mod config;
pub mod error;
pub mod filter;
pub mod hash;
pub mod types;

pub use config::AppConfig;
pub use error::GrantcastError;
pub use filter::{is_low_signal_cast, normalize_membership, MIN_REPLY_LENGTH};
pub use hash::{compute_content_hash, job_id_key, EMBEDDING_VERSION};
pub use types::*;
