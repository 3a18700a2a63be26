use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::tally::Accumulator;
use crate::transport::{Message, MessageHandler};

/// Counts every delivered vote towards the option named in its body.
///
/// Nothing is checked against the stored polls here; a vote for an option
/// no poll lists is counted and later ignored by the database update.
pub struct IngestHandler {
    accumulator: Arc<Accumulator>,
}

impl IngestHandler {
    pub fn new(accumulator: Arc<Accumulator>) -> Self {
        Self { accumulator }
    }
}

impl MessageHandler for IngestHandler {
    fn handle_message(&self, message: &Message) -> Result<()> {
        let vote = String::from_utf8_lossy(&message.body);
        debug!("Vote {} for '{}'", message.id, vote);
        self.accumulator.increment(&vote);
        Ok(())
    }
}
