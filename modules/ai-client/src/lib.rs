pub mod claude;
pub mod error;
pub mod openai;
pub mod schema;
pub mod traits;
pub mod util;

pub use claude::Claude;
pub use error::{classify_error, AiErrorKind};
pub use openai::OpenAi;
pub use schema::StructuredOutput;
pub use traits::EmbedAgent;
