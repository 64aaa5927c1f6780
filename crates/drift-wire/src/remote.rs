use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use drift_types::{EngineError, Mode};

/// Records exchanged over the brokered message channel.
///
/// The channel preserves message boundaries, so each record is one
/// standalone JSON message; no delimiter is involved. Chunk bytes
/// ride base64-encoded inside the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RemoteFrame {
    #[serde(rename_all = "camelCase")]
    FileMeta {
        file_name: String,
        /// Fresh per file, so duplicate filenames in one session stay
        /// unambiguous.
        transfer_id: String,
        file_size: u64,
        total_chunks: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u64,
        /// Base64 of the raw chunk bytes.
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    ChunkAck {
        transfer_id: String,
        /// Cumulative count of chunks the receiver has taken in.
        received_chunks: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete { transfer_id: String, file_size: u64 },
    DisconnectRequest { reason: String, mode: Mode },
}

impl RemoteFrame {
    pub fn encode(&self) -> Result<Bytes, EngineError> {
        let out = serde_json::to_vec(self).map_err(EngineError::MalformedFrame)?;
        Ok(Bytes::from(out))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(raw).map_err(EngineError::MalformedFrame)
    }

    /// Wrap raw chunk bytes for transport.
    pub fn encode_chunk(data: &[u8]) -> String {
        BASE64.encode(data)
    }

    /// Recover raw chunk bytes from a `file-chunk` record.
    pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>, EngineError> {
        BASE64
            .decode(encoded)
            .map_err(|e| EngineError::ProtocolViolation(format!("bad chunk encoding: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_use_documented_tags() {
        let frame = RemoteFrame::FileMeta {
            file_name: "dup.bin".into(),
            transfer_id: "t-1".into(),
            file_size: 5_242_880,
            total_chunks: 20,
        };
        let json = serde_json::to_value(&frame).expect("serialise");
        assert_eq!(json["type"], "file-meta");
        assert_eq!(json["data"]["fileName"], "dup.bin");
        assert_eq!(json["data"]["transferId"], "t-1");
        assert_eq!(json["data"]["totalChunks"], 20);

        let frame = RemoteFrame::ChunkAck {
            transfer_id: "t-1".into(),
            received_chunks: 40,
        };
        let json = serde_json::to_value(&frame).expect("serialise");
        assert_eq!(json["type"], "chunk-ack");
        assert_eq!(json["data"]["receivedChunks"], 40);

        let frame = RemoteFrame::DisconnectRequest {
            reason: "user quit".into(),
            mode: Mode::Receiver,
        };
        let json = serde_json::to_value(&frame).expect("serialise");
        assert_eq!(json["type"], "disconnect-request");
        assert_eq!(json["data"]["mode"], "receiver");
    }

    #[test]
    fn chunks_survive_the_base64_round_trip() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let frame = RemoteFrame::FileChunk {
            transfer_id: "t-2".into(),
            chunk_index: 7,
            chunk: RemoteFrame::encode_chunk(&data),
        };

        let wire = frame.encode().expect("encode");
        let back = RemoteFrame::decode(&wire).expect("decode");
        let RemoteFrame::FileChunk { chunk, .. } = back else {
            panic!("wrong variant");
        };
        assert_eq!(RemoteFrame::decode_chunk(&chunk).expect("decode chunk"), data);
    }

    #[test]
    fn bad_chunk_encoding_is_a_protocol_violation() {
        let err = RemoteFrame::decode_chunk("!!not base64!!").expect_err("must fail");
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
    }
}
