use crate::network::error::{ProtocolError, ProtocolResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Control-plane messages exchanged between benchmark peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Handshake
    Hello { name: String },

    // Address discovery
    GetAddress,
    Address { address: String },

    // Resource rounds
    GetResources,
    Resources { hashes: Vec<String> },
    Result { hash: String },
}

/// Variant discriminant carrying the stable wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    GetAddress,
    Address,
    GetResources,
    Resources,
    Result,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Hello,
        MessageKind::GetAddress,
        MessageKind::Address,
        MessageKind::GetResources,
        MessageKind::Resources,
        MessageKind::Result,
    ];

    /// Wire tag. These values are part of the protocol and never change.
    pub const fn tag(self) -> u16 {
        match self {
            MessageKind::Hello => 1,
            MessageKind::GetAddress => 10,
            MessageKind::Address => 11,
            MessageKind::GetResources => 20,
            MessageKind::Resources => 21,
            MessageKind::Result => 30,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::Hello => "Hello",
            MessageKind::GetAddress => "GetAddress",
            MessageKind::Address => "Address",
            MessageKind::GetResources => "GetResources",
            MessageKind::Resources => "Resources",
            MessageKind::Result => "Result",
        }
    }

    fn decoder(self) -> Decoder {
        match self {
            MessageKind::Hello => decode_hello,
            MessageKind::GetAddress => decode_get_address,
            MessageKind::Address => decode_address,
            MessageKind::GetResources => decode_get_resources,
            MessageKind::Resources => decode_resources,
            MessageKind::Result => decode_result,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Decoder = fn(&[u8]) -> ProtocolResult<Message>;

/// Tag -> decoder table, built on first use from every message kind.
static REGISTRY: Lazy<HashMap<u16, (MessageKind, Decoder)>> = Lazy::new(|| {
    let mut registry = HashMap::with_capacity(MessageKind::ALL.len());
    for kind in MessageKind::ALL {
        let previous = registry.insert(kind.tag(), (kind, kind.decoder()));
        assert!(previous.is_none(), "duplicate message tag {}", kind.tag());
    }
    registry
});

fn decode_text(content: &[u8]) -> ProtocolResult<String> {
    let text = String::from_utf8(content.to_vec())?;
    Ok(text.trim().to_string())
}

fn decode_hello(content: &[u8]) -> ProtocolResult<Message> {
    Ok(Message::Hello {
        name: decode_text(content)?,
    })
}

fn decode_get_address(_: &[u8]) -> ProtocolResult<Message> {
    Ok(Message::GetAddress)
}

fn decode_get_resources(_: &[u8]) -> ProtocolResult<Message> {
    Ok(Message::GetResources)
}

fn decode_address(content: &[u8]) -> ProtocolResult<Message> {
    Ok(Message::Address {
        address: decode_text(content)?,
    })
}

fn decode_resources(content: &[u8]) -> ProtocolResult<Message> {
    let hashes = if content.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(content)?
    };
    Ok(Message::Resources { hashes })
}

fn decode_result(content: &[u8]) -> ProtocolResult<Message> {
    Ok(Message::Result {
        hash: decode_text(content)?,
    })
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::GetAddress => MessageKind::GetAddress,
            Message::Address { .. } => MessageKind::Address,
            Message::GetResources => MessageKind::GetResources,
            Message::Resources { .. } => MessageKind::Resources,
            Message::Result { .. } => MessageKind::Result,
        }
    }

    pub fn tag(&self) -> u16 {
        self.kind().tag()
    }

    /// Serialize the payload region of a frame
    pub fn serialize(&self) -> ProtocolResult<Vec<u8>> {
        let content = match self {
            Message::Hello { name } => name.as_bytes().to_vec(),
            Message::Address { address } => address.as_bytes().to_vec(),
            Message::Result { hash } => hash.as_bytes().to_vec(),
            Message::Resources { hashes } => serde_json::to_vec(hashes)?,
            Message::GetAddress | Message::GetResources => Vec::new(),
        };
        Ok(content)
    }

    /// Decode a payload for `tag` through the registry
    pub fn deserialize(tag: u16, content: &[u8]) -> ProtocolResult<Message> {
        let (_, decode) = REGISTRY
            .get(&tag)
            .ok_or(ProtocolError::UnknownMessage(tag))?;
        decode(content)
    }
}

/// A decoded message together with its logical addressing.
///
/// Empty `src` / `dst` mean "unaddressed", i.e. the immediate connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWrapper {
    pub msg: Message,
    pub src: String,
    pub dst: String,
}

impl MessageWrapper {
    pub fn new(msg: Message, src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            msg,
            src: src.into(),
            dst: dst.into(),
        }
    }
}
