//! Paged directory-listing snapshot.
//!
//! A listing is materialised once when the directory handle opens;
//! entries created or removed afterwards do not appear. Each page call
//! hands back the next run of entries and signals end-of-stream once the
//! snapshot is exhausted.

use russh_sftp::protocol::File;

pub struct Listing {
    entries: Vec<File>,
}

impl Listing {
    pub fn new(entries: Vec<File>) -> Self {
        Listing { entries }
    }

    /// Next page of at most `max` entries, or `None` once exhausted.
    pub fn next_page(&mut self, max: usize) -> Option<Vec<File>> {
        if self.entries.is_empty() {
            return None;
        }
        let take = max.min(self.entries.len());
        Some(self.entries.drain(..take).collect())
    }
}
