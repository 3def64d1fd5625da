use std::io;
use std::path::{Path, PathBuf};

use minifw_common::Rule;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::control::{ControlError, Status};
use crate::wire::{get_rule, ControlMessage, RULE_RECORD_LEN};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot open control channel {}: {source}", .path.display())]
    ChannelUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("incomplete write to control channel: {0}")]
    IncompleteWrite(#[source] io::Error),
    #[error("incomplete read from control channel")]
    IncompleteRead,
    #[error("unknown status byte {0}")]
    UnknownStatus(u8),
    #[error("request rejected: {0}")]
    Rejected(Status),
    #[error("bad rule record: {0}")]
    BadRecord(#[from] ControlError),
}

/// Talks to a running daemon over its control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn add(&self, rule: Rule) -> Result<(), ClientError> {
        self.send(&ControlMessage::Add(rule)).await.map(drop)
    }

    pub async fn remove(&self, rule: Rule) -> Result<(), ClientError> {
        self.send(&ControlMessage::Remove(rule)).await.map(drop)
    }

    /// The daemon's rules in store order.
    pub async fn view(&self) -> Result<Vec<Rule>, ClientError> {
        self.send(&ControlMessage::View).await
    }

    /// Sends one message and returns the rule records that followed the
    /// status byte (none for add/remove).
    pub async fn send(&self, message: &ControlMessage) -> Result<Vec<Rule>, ClientError> {
        let mut stream = UnixStream::connect(&self.path).await.map_err(|source| {
            ClientError::ChannelUnavailable {
                path: self.path.clone(),
                source,
            }
        })?;

        stream
            .write_all(&message.encode())
            .await
            .map_err(ClientError::IncompleteWrite)?;
        stream.shutdown().await.map_err(ClientError::IncompleteWrite)?;

        let mut reply = Vec::new();
        stream
            .read_to_end(&mut reply)
            .await
            .map_err(|_| ClientError::IncompleteRead)?;

        let (&status, mut records) = reply.split_first().ok_or(ClientError::IncompleteRead)?;
        match Status::from_u8(status) {
            Some(Status::Ok) => {}
            Some(status) => return Err(ClientError::Rejected(status)),
            None => return Err(ClientError::UnknownStatus(status)),
        }

        // Fewer bytes than one record ends the stream; a partial record is an error.
        if records.len() % RULE_RECORD_LEN != 0 {
            return Err(ClientError::IncompleteRead);
        }
        let mut rules = Vec::with_capacity(records.len() / RULE_RECORD_LEN);
        while !records.is_empty() {
            rules.push(get_rule(&mut records)?);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::put_rule;
    use minifw_common::{Direction, IpVersion};
    use tokio::net::UnixListener;

    /// Answers a single request on a fresh socket with `reply`, verbatim.
    async fn view_against(reply: Vec<u8>) -> Result<Vec<Rule>, ClientError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            stream.write_all(&reply).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });

        let result = ControlClient::new(&path).view().await;
        let request = server.await.unwrap();
        assert_eq!(request, ControlMessage::View.encode().to_vec());
        result
    }

    #[tokio::test]
    async fn test_empty_reply_is_incomplete_read() {
        assert!(matches!(view_against(Vec::new()).await, Err(ClientError::IncompleteRead)));
    }

    #[tokio::test]
    async fn test_partial_record_is_incomplete_read() {
        let mut reply = vec![Status::Ok as u8];
        reply.extend_from_slice(&[0; RULE_RECORD_LEN - 1]);
        assert!(matches!(view_against(reply).await, Err(ClientError::IncompleteRead)));
    }

    #[tokio::test]
    async fn test_unknown_status() {
        assert!(matches!(view_against(vec![9]).await, Err(ClientError::UnknownStatus(9))));
    }

    #[tokio::test]
    async fn test_invalid_record_is_bad_record() {
        let mut reply = vec![Status::Ok as u8];
        put_rule(&mut reply, &Rule::new(Direction::Inbound, IpVersion::V4));
        reply[1] = 2;
        assert!(matches!(
            view_against(reply).await,
            Err(ClientError::BadRecord(ControlError::MalformedMessage(_)))
        ));
    }

    #[tokio::test]
    async fn test_records_after_ok_status() {
        let rules = [
            Rule::new(Direction::Inbound, IpVersion::V4).with_ports(0, 22),
            Rule::new(Direction::Outbound, IpVersion::V4).with_ports(0, 53),
        ];
        let mut reply = vec![Status::Ok as u8];
        for rule in &rules {
            put_rule(&mut reply, rule);
        }
        assert_eq!(view_against(reply).await.unwrap(), rules);
    }

    #[tokio::test]
    async fn test_missing_socket_is_channel_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(dir.path().join("absent.sock"));
        assert!(matches!(
            client.view().await,
            Err(ClientError::ChannelUnavailable { .. })
        ));
    }
}
