//! WebSocket protocol shared by the relay, host SDKs and the browser client.
//! Every binary frame on `/ws` is exactly one encoded [`Message`]. The schema is
//! declared with prost derives so no `protoc` step is needed at build time.

use bytes::Bytes;
use prost::Message as _;

pub use prost::DecodeError;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// Caller-assigned correlation id, echoed on replies and exceptions.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(
        oneof = "message::Payload",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10"
    )]
    pub payload: Option<message::Payload>,
}

pub mod message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        InitializeHost(super::InitializeHost),
        #[prost(message, tag = "3")]
        InitializeHostCompleted(super::InitializeHostCompleted),
        #[prost(message, tag = "4")]
        InitializeClient(super::InitializeClient),
        #[prost(message, tag = "5")]
        InitializeClientCompleted(super::InitializeClientCompleted),
        #[prost(message, tag = "6")]
        RenderWidget(super::RenderWidget),
        #[prost(message, tag = "7")]
        RerunPage(super::RerunPage),
        #[prost(message, tag = "8")]
        CloseSession(super::CloseSession),
        #[prost(message, tag = "9")]
        ScriptFinished(super::ScriptFinished),
        #[prost(message, tag = "10")]
        Exception(super::Exception),
    }

    impl Payload {
        /// Stable name for logs and metric labels.
        pub fn kind(&self) -> &'static str {
            match self {
                Payload::InitializeHost(_) => "initialize_host",
                Payload::InitializeHostCompleted(_) => "initialize_host_completed",
                Payload::InitializeClient(_) => "initialize_client",
                Payload::InitializeClientCompleted(_) => "initialize_client_completed",
                Payload::RenderWidget(_) => "render_widget",
                Payload::RerunPage(_) => "rerun_page",
                Payload::CloseSession(_) => "close_session",
                Payload::ScriptFinished(_) => "script_finished",
                Payload::Exception(_) => "exception",
            }
        }
    }
}

pub use message::Payload;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeHost {
    #[prost(string, tag = "1")]
    pub api_key: String,
    #[prost(string, tag = "2")]
    pub sdk_name: String,
    #[prost(string, tag = "3")]
    pub sdk_version: String,
    #[prost(message, repeated, tag = "4")]
    pub pages: Vec<Page>,
}

/// A page as declared by a host on handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Page {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub route: String,
    #[prost(int32, repeated, tag = "4")]
    pub path: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeHostCompleted {
    #[prost(string, tag = "1")]
    pub host_instance_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeClient {
    #[prost(string, optional, tag = "1")]
    pub session_id: Option<String>,
    #[prost(string, tag = "2")]
    pub page_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeClientCompleted {
    #[prost(string, tag = "1")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RenderWidget {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(string, tag = "2")]
    pub page_id: String,
    #[prost(int32, repeated, tag = "3")]
    pub path: Vec<i32>,
    #[prost(message, optional, tag = "4")]
    pub widget: Option<Widget>,
}

/// Widget body. The relay never looks inside `state`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Widget {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    #[prost(bytes = "vec", tag = "3")]
    pub state: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RerunPage {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(string, tag = "2")]
    pub page_id: String,
    #[prost(message, repeated, tag = "3")]
    pub states: Vec<Widget>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseSession {
    #[prost(string, tag = "1")]
    pub session_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ScriptStatus {
    Unspecified = 0,
    Success = 1,
    Failure = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScriptFinished {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(enumeration = "ScriptStatus", tag = "2")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Exception {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, repeated, tag = "3")]
    pub stack_trace: Vec<String>,
    #[prost(string, tag = "4")]
    pub session_id: String,
}

impl Message {
    /// Builds a message with a freshly generated correlation id.
    pub fn new(payload: Payload) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_id(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload: Some(payload),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.as_ref().map(Payload::kind).unwrap_or("unknown")
    }

    /// Session id carried by session-scoped payloads.
    pub fn session_id(&self) -> Option<&str> {
        match self.payload.as_ref()? {
            Payload::InitializeClient(m) => m.session_id.as_deref(),
            Payload::InitializeClientCompleted(m) => Some(&m.session_id),
            Payload::RenderWidget(m) => Some(&m.session_id),
            Payload::RerunPage(m) => Some(&m.session_id),
            Payload::CloseSession(m) => Some(&m.session_id),
            Payload::ScriptFinished(m) => Some(&m.session_id),
            Payload::Exception(m) if !m.session_id.is_empty() => Some(&m.session_id),
            _ => None,
        }
    }
}

pub fn encode_frame(message: &Message) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<Message, DecodeError> {
    Message::decode(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_widget_survives_the_wire() {
        let original = Message::with_id(
            "m-1",
            Payload::RenderWidget(RenderWidget {
                session_id: "s-1".into(),
                page_id: "p-1".into(),
                path: vec![0, 3, 1],
                widget: Some(Widget {
                    id: "w-1".into(),
                    kind: "text_input".into(),
                    state: vec![0, 159, 146, 150],
                }),
            }),
        );
        let frame = encode_frame(&original);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(encode_frame(&decoded), frame);
        assert_eq!(decoded.session_id(), Some("s-1"));
    }

    #[test]
    fn unknown_variant_decodes_without_payload() {
        // field 1 = "x", field 42 = length-delimited "zz"
        let frame = [0x0a, 0x01, b'x', 0xd2, 0x02, 0x02, b'z', b'z'];
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.id, "x");
        assert!(decoded.payload.is_none());
        assert_eq!(decoded.kind(), "unknown");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_frame(&[0xff, 0xff, 0xff]).is_err());
    }
}
