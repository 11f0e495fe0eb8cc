//! Session state, the file queue, and the event stream.

pub mod files;
pub mod state;

pub use files::{FileEntry, FileQueue, FileStatus};
pub use state::{EventSink, NoticeLevel, SessionEvent, SessionState};
