//! Conversation memories backed by the message store of the current request.

use anyhow::Result;

use crate::context;
use crate::models::Message;
use crate::traits::Memory;

/// The whole conversation history.
#[derive(Debug, Default)]
pub struct SqlBufferMemory;

impl Memory for SqlBufferMemory {
    fn load_history(&self) -> Result<Vec<Message>> {
        let ctx = context::current()?;
        ctx.block_on(ctx.messages.list(&ctx.conversation_id))
    }
}

/// Only the last `turns` human/ai exchanges.
#[derive(Debug)]
pub struct SqlWindowMemory {
    turns: usize,
}

impl SqlWindowMemory {
    pub fn new(turns: usize) -> Self {
        Self { turns }
    }
}

impl Memory for SqlWindowMemory {
    fn load_history(&self) -> Result<Vec<Message>> {
        let mut history = SqlBufferMemory.load_history()?;
        let keep = self.turns * 2;
        if history.len() > keep {
            history.drain(..history.len() - keep);
        }
        Ok(history)
    }
}
