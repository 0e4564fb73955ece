//! Wire messages of the remote access layer.
//!
//! Frames are single-line JSON documents terminated by `\n`. The client sends
//! [`ClientFrame`]s carrying a request id; the server answers each with exactly one
//! [`ServerFrame::Reply`] and, independently, pushes attribute changes and action
//! progress for the subscriptions and actions the client opened.
//!
//! Pushes for one subscription are written in the order the attribute produced them;
//! every frame of a connection goes through one writer task, so the client reads them
//! in that order too.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::action::ActionUpdate;
use crate::component::ComponentDescriptor;
use crate::error::{DaqError, DaqResult};
use crate::limits::{validate_frame_len, MAX_FRAME_BYTES};
use crate::metadata::RawMetadata;

/// Correlates a reply with its request. Also names remote actions.
pub type RequestId = u64;

/// Client-chosen identifier of a push subscription.
pub type SubscriptionId = u64;

/// Request sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Request id, unique per connection
    pub id: RequestId,
    /// The request
    pub request: Request,
}

/// Operations a client can ask for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Request {
    Ping,
    ListComponents,
    Describe {
        component: String,
    },
    GetAttribute {
        component: String,
        attribute: String,
    },
    SetAttribute {
        component: String,
        attribute: String,
        value: Value,
    },
    /// Open a push channel for one attribute. The current value is pushed before the
    /// reply, flagged `initial`.
    Subscribe {
        component: String,
        attribute: String,
        subscription: SubscriptionId,
    },
    Unsubscribe {
        subscription: SubscriptionId,
    },
    GetMetadata {
        component: String,
    },
    UpdateMetadata {
        component: String,
        metadata: RawMetadata,
    },
    /// Start an action; the request id names the action in later pushes.
    Execute {
        component: String,
        action: String,
        args: Value,
    },
    CancelAction {
        action: RequestId,
    },
    Terminate {
        component: String,
    },
}

impl Request {
    /// Short operation name used in logs and errors.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::ListComponents => "list_components",
            Request::Describe { .. } => "describe",
            Request::GetAttribute { .. } => "get_attribute",
            Request::SetAttribute { .. } => "set_attribute",
            Request::Subscribe { .. } => "subscribe",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::GetMetadata { .. } => "get_metadata",
            Request::UpdateMetadata { .. } => "update_metadata",
            Request::Execute { .. } => "execute",
            Request::CancelAction { .. } => "cancel_action",
            Request::Terminate { .. } => "terminate",
        }
    }
}

/// Successful reply payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Reply {
    Pong { vocabulary_version: u32 },
    Components { descriptors: Vec<ComponentDescriptor> },
    Descriptor { descriptor: ComponentDescriptor },
    Value { value: Value },
    Metadata { metadata: RawMetadata },
    Subscribed,
    ActionAccepted { action: RequestId },
    Cancelled { accepted: bool },
    Ok,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ServerFrame {
    /// Answer to the request with the same id.
    Reply {
        id: RequestId,
        result: Result<Reply, DaqError>,
    },
    /// New value of a subscribed attribute.
    AttributeChanged {
        subscription: SubscriptionId,
        value: Value,
        initial: bool,
    },
    /// Non-terminal state or progress change of a remote action.
    ActionUpdate {
        action: RequestId,
        update: ActionUpdate,
    },
    /// Terminal outcome of a remote action.
    ActionFinished {
        action: RequestId,
        outcome: Result<Value, DaqError>,
    },
}

/// Read one frame. `Ok(None)` on a clean end of stream.
///
/// # Errors
/// [`DaqError::RemoteCommunication`] for a frame above [`MAX_FRAME_BYTES`] or a stream
/// that ends mid-frame; [`DaqError::Serialization`] for malformed JSON.
pub async fn read_frame<R, T>(reader: &mut R) -> DaqResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut line = String::new();
    let limit = (MAX_FRAME_BYTES + 1) as u64;
    let read = (&mut *reader).take(limit).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        validate_frame_len(read)?;
        return Err(DaqError::RemoteCommunication(
            "stream ended in the middle of a frame".to_string(),
        ));
    }
    let frame = line.trim_end_matches(['\n', '\r']);
    validate_frame_len(frame.len())?;
    Ok(Some(serde_json::from_str(frame)?))
}

/// Serialize `frame` as one line.
pub fn encode_frame<T: Serialize>(frame: &T) -> DaqResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    validate_frame_len(bytes.len())?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> DaqResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionState, Progress};
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_request_wire_shape() {
        let frame = ClientFrame {
            id: 7,
            request: Request::SetAttribute {
                component: "ccd".into(),
                attribute: "exposureTime".into(),
                value: json!(0.05),
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "id": 7,
                "request": {
                    "op": "set_attribute",
                    "component": "ccd",
                    "attribute": "exposureTime",
                    "value": 0.05
                }
            })
        );
    }

    #[test]
    fn test_error_reply_keeps_variant() {
        let frame = ServerFrame::Reply {
            id: 1,
            result: Err(DaqError::validation("exposureTime", "out of range")),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: ServerFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[tokio::test]
    async fn test_read_frames_from_stream() {
        let update = ServerFrame::ActionUpdate {
            action: 3,
            update: ActionUpdate {
                state: ActionState::Running,
                progress: Progress::default(),
            },
        };
        let mut bytes = encode_frame(&update).unwrap();
        bytes.extend(encode_frame(&ServerFrame::Reply { id: 4, result: Ok(Reply::Ok) }).unwrap());

        let mut reader = BufReader::new(bytes.as_slice());
        let first: ServerFrame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, update);
        let second: Option<ServerFrame> = read_frame(&mut reader).await.unwrap();
        assert!(matches!(second, Some(ServerFrame::Reply { id: 4, .. })));
        let end: Option<ServerFrame> = read_frame(&mut reader).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut bytes = vec![b'a'; MAX_FRAME_BYTES + 10];
        bytes.push(b'\n');
        let mut reader = BufReader::new(bytes.as_slice());
        let result: DaqResult<Option<ClientFrame>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(DaqError::RemoteCommunication(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_rejected() {
        let mut reader = BufReader::new(&b"{\"id\":1"[..]);
        let result: DaqResult<Option<ClientFrame>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(DaqError::RemoteCommunication(_))));
    }
}
