use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{RuleStore, SnapshotIter, StoreError};
use crate::wire::ControlMessage;

/// Request-level failures, reported back to the controller as a [`Status`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    MalformedMessage(String),
    #[error("invalid mode {0}")]
    InvalidMode(u8),
    #[error("rule store is full ({capacity} rules)")]
    CapacityExceeded { capacity: usize },
    #[error("rule not found")]
    NotFound,
}

impl ControlError {
    pub fn status(&self) -> Status {
        match self {
            ControlError::MalformedMessage(_) => Status::MalformedMessage,
            ControlError::InvalidMode(_) => Status::InvalidMode,
            ControlError::CapacityExceeded { .. } => Status::CapacityExceeded,
            ControlError::NotFound => Status::NotFound,
        }
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CapacityExceeded { capacity } => {
                ControlError::CapacityExceeded { capacity }
            }
            StoreError::NotFound => ControlError::NotFound,
        }
    }
}

/// First byte of every reply on the control socket.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    MalformedMessage = 1,
    InvalidMode = 2,
    CapacityExceeded = 3,
    NotFound = 4,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::Ok),
            1 => Some(Status::MalformedMessage),
            2 => Some(Status::InvalidMode),
            3 => Some(Status::CapacityExceeded),
            4 => Some(Status::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::MalformedMessage => "malformed message",
            Status::InvalidMode => "invalid mode",
            Status::CapacityExceeded => "capacity exceeded",
            Status::NotFound => "not found",
        };
        f.write_str(text)
    }
}

/// What a successfully handled request produces.
pub enum Reply {
    /// Add/remove applied.
    Done,
    /// View: the rules to stream back, in store order.
    Rules(SnapshotIter),
}

/// Decodes control messages and applies them to the rule store.
pub struct ControlHandler {
    store: Arc<RuleStore>,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl ControlHandler {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self {
            store,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Requests handled so far, successful or not.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Handles one raw message as read off the control socket.
    pub fn handle_bytes(&self, message: &[u8]) -> Result<Reply, ControlError> {
        match ControlMessage::decode(message) {
            Ok(message) => self.dispatch(message),
            Err(err) => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("rejected control message: {}", err);
                Err(err)
            }
        }
    }

    pub fn dispatch(&self, message: ControlMessage) -> Result<Reply, ControlError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let result = match message {
            ControlMessage::Add(rule) => self.store.add(rule).map(|()| Reply::Done),
            ControlMessage::Remove(rule) => self.store.remove(&rule).map(|()| Reply::Done),
            ControlMessage::View => Ok(Reply::Rules(self.store.snapshot_iter())),
        };

        match result {
            Ok(reply) => {
                debug!(mode = ?message.mode(), rules = self.store.len(), "control request applied");
                Ok(reply)
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(mode = ?message.mode(), "control request failed: {}", err);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Mode, CONTROL_MESSAGE_LEN};
    use minifw_common::{Direction, IpVersion, Rule};

    fn handler(capacity: Option<usize>) -> ControlHandler {
        ControlHandler::new(Arc::new(RuleStore::new(capacity)))
    }

    fn rule(port: u16) -> Rule {
        Rule::new(Direction::Outbound, IpVersion::V4).with_ports(port, 0)
    }

    fn view(handler: &ControlHandler) -> Vec<Rule> {
        match handler.dispatch(ControlMessage::View) {
            Ok(Reply::Rules(rules)) => rules.collect(),
            _ => panic!("view failed"),
        }
    }

    #[test]
    fn test_add_remove_view_dispatch() {
        let handler = handler(None);
        handler.handle_bytes(&ControlMessage::Add(rule(1)).encode()).unwrap();
        handler.handle_bytes(&ControlMessage::Add(rule(2)).encode()).unwrap();
        assert_eq!(view(&handler), vec![rule(1), rule(2)]);

        handler.handle_bytes(&ControlMessage::Remove(rule(1)).encode()).unwrap();
        assert_eq!(view(&handler), vec![rule(2)]);
        assert_eq!(handler.requests(), 5);
        assert_eq!(handler.errors(), 0);
    }

    #[test]
    fn test_remove_missing_reports_not_found() {
        let handler = handler(None);
        let err = handler
            .handle_bytes(&ControlMessage::Remove(rule(1)).encode())
            .err()
            .unwrap();
        assert_eq!(err, ControlError::NotFound);
        assert_eq!(err.status(), Status::NotFound);
        assert!(handler.store().is_empty());
    }

    #[test]
    fn test_capacity_surfaces_as_error() {
        let handler = handler(Some(1));
        handler.dispatch(ControlMessage::Add(rule(1))).unwrap();
        let err = handler.dispatch(ControlMessage::Add(rule(2))).err().unwrap();
        assert_eq!(err, ControlError::CapacityExceeded { capacity: 1 });
        assert_eq!(err.status(), Status::CapacityExceeded);
        assert_eq!(view(&handler), vec![rule(1)]);
        assert_eq!(handler.errors(), 1);
    }

    #[test]
    fn test_bad_messages_do_not_mutate() {
        let handler = handler(None);

        let short = [Mode::Add as u8; CONTROL_MESSAGE_LEN - 1];
        let err = handler.handle_bytes(&short).err().unwrap();
        assert_eq!(err.status(), Status::MalformedMessage);

        let mut bad_mode = ControlMessage::Add(rule(1)).encode().to_vec();
        bad_mode[0] = 0;
        let err = handler.handle_bytes(&bad_mode).err().unwrap();
        assert_eq!(err, ControlError::InvalidMode(0));

        assert!(handler.store().is_empty());
        assert_eq!(handler.errors(), 2);
    }
}
