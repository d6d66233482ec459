pub mod locks;
pub mod sessions;

pub use locks::KeyedMutex;
pub use sessions::{
    ContextRecord, FileSessionStore, HistoryRecord, InMemorySessionStore, SessionStore,
    StoreError,
};
