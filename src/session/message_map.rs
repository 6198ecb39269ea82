use crate::errors::SessionError;
use crate::session::NetHandle;
use crate::wire::{Envelope, OpCode};
use std::collections::HashMap;

pub type MessageHandler<S> = fn(&mut S, NetHandle, &Envelope) -> Result<(), SessionError>;

/// Opcode to handler table, built once per session type.
pub struct MessageMap<S> {
    handlers: HashMap<OpCode, MessageHandler<S>>,
}

impl<S> MessageMap<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on(mut self, op_code: OpCode, handler: MessageHandler<S>) -> Self {
        self.handlers.insert(op_code, handler);
        self
    }

    pub fn handles(&self, op_code: OpCode) -> bool {
        self.handlers.contains_key(&op_code)
    }

    /// Runs the handler for the envelope's opcode. `Ok(false)` means no
    /// handler is registered.
    pub fn dispatch(
        &self,
        session: &mut S,
        handle: NetHandle,
        envelope: &Envelope,
    ) -> Result<bool, SessionError> {
        match self.handlers.get(&envelope.header.op_code) {
            Some(handler) => handler(session, handle, envelope).map(|()| true),
            None => Ok(false),
        }
    }
}

impl<S> Default for MessageMap<S> {
    fn default() -> Self {
        Self::new()
    }
}
