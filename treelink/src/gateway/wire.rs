//! Tree-gateway traffic carried inside connector [`Message`]s.
//!
//! Commands and replies are postcard-encoded into the [`TREE_FIELD`] bytes
//! field of a message whose `what` is [`TREE_COMMAND_WHAT`] or
//! [`TREE_REPLY_WHAT`]. One reply message may carry several replies; they
//! are delivered to subscribers as one callback batch.

use serde::{Deserialize, Serialize};

use crate::filter::QueryFilter;
use crate::message::{Message, WireError};

use super::types::{GatewayEvent, GatewayFlags, TreeNode};

pub const TREE_COMMAND_WHAT: u32 = 0x5f74_6300;
pub const TREE_REPLY_WHAT: u32 = 0x5f74_7200;
pub const TREE_FIELD: &str = "_tree";

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeCommand {
    Subscribe {
        path: String,
        filter: Option<QueryFilter>,
        flags: GatewayFlags,
    },
    Unsubscribe {
        path: String,
    },
    RequestNodeValues {
        paths: Vec<String>,
        filter: Option<QueryFilter>,
    },
    RequestSubtrees {
        paths: Vec<String>,
        filter: Option<QueryFilter>,
        tag: String,
        max_depth: Option<u32>,
    },
    UploadNodeValue {
        path: String,
        payload: Message,
        flags: GatewayFlags,
    },
    UploadSubtree {
        base_path: String,
        nodes: Vec<TreeNode>,
        flags: GatewayFlags,
    },
    DeleteNodes {
        paths: Vec<String>,
        filter: Option<QueryFilter>,
        flags: GatewayFlags,
    },
    MoveIndexEntry {
        path: String,
        from: u32,
        to: u32,
        flags: GatewayFlags,
    },
    PingLocalPeer {
        tag: String,
    },
    PingSeniorPeer {
        tag: String,
    },
    MessageToSeniorPeer {
        message: Message,
        reply_tag: String,
    },
    MessageToSubscriber {
        message: Message,
        subscriber_tag: String,
    },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeReply {
    NodeUpdated { path: String, payload: Option<Message> },
    IndexCleared { path: String },
    IndexEntryInserted { path: String, index: u32, child: String },
    IndexEntryRemoved { path: String, index: u32 },
    SubtreeResult { tag: String, nodes: Vec<TreeNode> },
    Pong { tag: String },
    MessageForSubscriber { tag: String, message: Message },
    ShuttingDown,
}

impl From<TreeReply> for GatewayEvent {
    fn from(reply: TreeReply) -> Self {
        match reply {
            TreeReply::NodeUpdated { path, payload } => Self::NodeUpdated { path, payload },
            TreeReply::IndexCleared { path } => Self::IndexCleared { path },
            TreeReply::IndexEntryInserted { path, index, child } => {
                Self::IndexEntryInserted { path, index, child }
            }
            TreeReply::IndexEntryRemoved { path, index } => Self::IndexEntryRemoved { path, index },
            TreeReply::SubtreeResult { tag, nodes } => Self::SubtreeResult { tag, nodes },
            TreeReply::Pong { tag } => Self::Pong { tag },
            TreeReply::MessageForSubscriber { tag, message } => {
                Self::MessageForSubscriber { tag, message }
            }
            TreeReply::ShuttingDown => Self::ShuttingDown,
        }
    }
}

fn seal_body<T: Serialize>(what: u32, body: &T) -> Result<Message, WireError> {
    let bytes = postcard::to_stdvec(body)?;
    Ok(Message::new(what).with(TREE_FIELD, bytes))
}

fn open_body<'a, T: Deserialize<'a>>(what: u32, msg: &'a Message) -> Result<T, WireError> {
    if msg.what != what {
        return Err(WireError::NotTreeMessage(msg.what));
    }
    let bytes = msg
        .get_bytes(TREE_FIELD)
        .ok_or(WireError::NotTreeMessage(msg.what))?;
    postcard::from_bytes(bytes).map_err(WireError::Decode)
}

impl TreeCommand {
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn to_message(&self) -> Result<Message, WireError> {
        seal_body(TREE_COMMAND_WHAT, self)
    }

    /// # Errors
    ///
    /// Returns [`WireError::NotTreeMessage`] for other traffic and
    /// [`WireError::Decode`] for a malformed body.
    pub fn from_message(msg: &Message) -> Result<Self, WireError> {
        open_body(TREE_COMMAND_WHAT, msg)
    }
}

impl TreeReply {
    /// Packs a batch of replies into one message.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn batch_to_message(replies: &[Self]) -> Result<Message, WireError> {
        seal_body(TREE_REPLY_WHAT, &replies)
    }

    /// # Errors
    ///
    /// Returns [`WireError::NotTreeMessage`] for other traffic and
    /// [`WireError::Decode`] for a malformed body.
    pub fn batch_from_message(msg: &Message) -> Result<Vec<Self>, WireError> {
        open_body(TREE_REPLY_WHAT, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_survives_message_wrapping() {
        let cmd = TreeCommand::RequestSubtrees {
            paths: vec!["a/b".into()],
            filter: Some(QueryFilter::Exists("x".into())),
            tag: "_7_:req1".into(),
            max_depth: Some(2),
        };
        let msg = cmd.to_message().unwrap();
        assert_eq!(msg.what, TREE_COMMAND_WHAT);
        assert_eq!(TreeCommand::from_message(&msg).unwrap(), cmd);
    }

    #[test]
    fn replies_travel_as_batches() {
        let replies = vec![
            TreeReply::Pong { tag: "_allow_:1".into() },
            TreeReply::NodeUpdated {
                path: "a/b".into(),
                payload: None,
            },
        ];
        let msg = TreeReply::batch_to_message(&replies).unwrap();
        let decoded = TreeReply::batch_from_message(&msg).unwrap();
        let events: Vec<GatewayEvent> = decoded.into_iter().map(GatewayEvent::from).collect();
        assert_eq!(events[0], GatewayEvent::Pong { tag: "_allow_:1".into() });
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn foreign_messages_are_rejected() {
        let msg = Message::new(42).with("x", 1i64);
        assert!(matches!(
            TreeReply::batch_from_message(&msg),
            Err(WireError::NotTreeMessage(42))
        ));
        let cmd_msg = TreeCommand::PingLocalPeer { tag: "t".into() }
            .to_message()
            .unwrap();
        assert!(matches!(
            TreeReply::batch_from_message(&cmd_msg),
            Err(WireError::NotTreeMessage(TREE_COMMAND_WHAT))
        ));
    }
}
