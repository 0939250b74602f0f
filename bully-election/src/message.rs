use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, PeerError};
use crate::identity::{PeerAddress, ProcessIdentity};
use crate::membership::Membership;

const LINE_ENDINGS: &[u8] = b"\n\r";

/// Longest frame accepted from a peer, newline included.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Every frame exchanged by nodes and the directory.
///
/// Peer messages name their sender so a receiver never has to guess who is
/// on the other end of an accepted socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Sent once to the directory, which answers with a [`Membership`] frame.
    Join {
        identity: ProcessIdentity,
        address: PeerAddress,
    },
    Election {
        from: ProcessIdentity,
        members: Membership,
    },
    Ok {
        from: ProcessIdentity,
        members: Membership,
    },
    Coordinator {
        from: ProcessIdentity,
        members: Membership,
    },
    Probe {
        from: ProcessIdentity,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::Election { .. } => "ELECTION",
            Message::Ok { .. } => "OK",
            Message::Coordinator { .. } => "COORDINATOR",
            Message::Probe { .. } => "PROBE",
        }
    }
}

/// Encodes one frame, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Decodes one frame. Trailing line endings are ignored; anything truncated,
/// unknown or blank is rejected.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let frame = trim_line_endings(bytes);
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Err(CodecError::Empty);
    }
    Ok(serde_json::from_slice(frame)?)
}

fn trim_line_endings(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|byte| !LINE_ENDINGS.contains(byte))
        .map_or(0, |last| last + 1);
    &bytes[..end]
}

/// Reads the next frame, skipping blank lines. `Ok(None)` means the peer
/// closed the connection cleanly. A line longer than [`MAX_FRAME_LEN`] is
/// rejected without waiting for its end.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, PeerError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await
            .map_err(PeerError::ReceiveFailed)?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes > MAX_FRAME_LEN {
            return Err(CodecError::TooLong(MAX_FRAME_LEN).into());
        }
        // A frame cut short by EOF still fails to parse below.
        let at_eof = line.last() != Some(&b'\n');
        match decode(&line) {
            Ok(message) => return Ok(Some(message)),
            Err(CodecError::Empty) if at_eof => return Ok(None),
            Err(CodecError::Empty) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode(message)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(PeerError::SendFailed)?;
    writer.flush().await.map_err(PeerError::SendFailed)?;
    Ok(())
}
