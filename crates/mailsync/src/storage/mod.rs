//! Mailbox log storage
//!
//! This module defines the read interface the sync engine consumes and the
//! write path that appends to the logs. Both backends implement the same
//! traits and are exercised by the same integration tests.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryMailbox;
pub use sqlite::SqliteMailbox;
pub use traits::{MailboxLogReader, MailboxWriter, NewItem};
