pub mod embed;
pub mod schema;
pub mod search;
pub mod store;

pub use embed::{EmbedError, Embedder, QUERY_PREFIX, normalize};
pub use schema::{
    CodingTaskState, ConversationStats, JournalEntry, Message, MessageSource, Reminder, Role,
    Schedule, StateFile, Summary, Topic, TriggerKind,
};
pub use search::{SearchError, SearchHit, search_journal, search_topics};
pub use store::{Store, StoreError, with_retry};
