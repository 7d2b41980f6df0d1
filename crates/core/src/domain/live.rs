// Live message model

use crate::domain::id::Id;
use serde::{Deserialize, Serialize};

/// Live channel: a (family, topic) pair such as ("board", "42")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel {
    pub family: String,
    pub topic: String,
}

impl Channel {
    pub fn new(family: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            topic: topic.into(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.family, self.topic)
    }
}

/// Delivery metadata carried next to the payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub dedup_key: String,
}

/// One live message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMsg {
    pub id: Id,
    pub envelope: Envelope,
    pub data: Vec<u8>,
}

impl LiveMsg {
    pub fn new(id: Id, envelope: Envelope, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            envelope,
            data: data.into(),
        }
    }

    /// Server-sent-event frame: `id: <decimal>` followed by one `data:` line
    /// per payload line, terminated by a blank line.
    pub fn sse_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 32);
        out.extend_from_slice(format!("id: {}\n", self.id.raw()).as_bytes());
        for line in self.data.split(|&b| b == b'\n') {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(line);
            out.push(b'\n');
        }
        out.push(b'\n');
        out
    }

    /// Write the SSE frame to `writer`
    pub async fn write_sse<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        use tokio::io::AsyncWriteExt;
        writer.write_all(&self.sse_frame()).await
    }
}
